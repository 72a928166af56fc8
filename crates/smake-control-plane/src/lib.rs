pub mod config;
pub mod features;
pub mod shared;

use std::sync::Arc;

use config::SmakeConfig;
use features::instance_store::repo::InMemoryInstanceRepository;
use features::instance_store::service::InstanceStore;
use features::lifecycle::repo::ProviderGateway;
use features::lifecycle::service::LifecycleService;
use features::observability::service::ObservabilityService;
use features::pool::repo::{NaiveStrategy, PoolingStrategy};
use features::pool::service::PoolReconciler;
use shared::error::ControlPlaneResult;
use smake_providers::{ComputeProvider, ReachabilityProbe};

/// The wired control plane: one store, one lifecycle adapter and one pool
/// reconciler sharing a provider and a metrics registry.
#[derive(Clone)]
pub struct ControlPlane {
    pub store: InstanceStore,
    pub lifecycle: LifecycleService,
    pub pool: PoolReconciler,
    pub metrics: ObservabilityService,
}

impl ControlPlane {
    /// Wire everything against a cloud that is both provider and probe,
    /// with the configured pool shape as a [`NaiveStrategy`].
    pub fn new<C>(config: &SmakeConfig, cloud: C) -> ControlPlaneResult<Self>
    where
        C: ComputeProvider + ReachabilityProbe + Clone + 'static,
    {
        Self::with_parts(
            config,
            Arc::new(cloud.clone()),
            Arc::new(cloud),
            Arc::new(NaiveStrategy::new(config.pool_shape.clone())),
        )
    }

    pub fn with_parts(
        config: &SmakeConfig,
        provider: Arc<dyn ComputeProvider>,
        probe: Arc<dyn ReachabilityProbe>,
        strategy: Arc<dyn PoolingStrategy>,
    ) -> ControlPlaneResult<Self> {
        let metrics = ObservabilityService::with_registry()?;
        let store = InstanceStore::new(
            Arc::new(InMemoryInstanceRepository::new()),
            config.instance_defaults(),
        );

        let lifecycle_settings = config.lifecycle_settings();
        let lifecycle = LifecycleService::new(
            store.clone(),
            ProviderGateway::new(provider.clone(), lifecycle_settings.tags.clone()),
            probe,
            lifecycle_settings,
            metrics.clone(),
        );
        let pool = PoolReconciler::new(
            provider,
            lifecycle.clone(),
            strategy,
            config.pool_settings(),
            metrics.clone(),
        );

        Ok(Self {
            store,
            lifecycle,
            pool,
            metrics,
        })
    }
}
