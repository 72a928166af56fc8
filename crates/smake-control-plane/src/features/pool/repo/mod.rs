use crate::shared::types::PoolRequirement;
use async_trait::async_trait;
use tracing::debug;

/// Pool-sizing policy consumed by the reconciler.
#[async_trait]
pub trait PoolingStrategy: Send + Sync {
    /// Desired pool shape, one entry per instance type.
    async fn required_instances(&self) -> Vec<PoolRequirement>;

    /// Called after an instance leaves the pool. Returning a requirement asks
    /// the reconciler to provision that many replacements.
    async fn notify_of_removal(
        &self,
        provider_id: &str,
        instance_type: &str,
    ) -> Option<PoolRequirement>;
}

/// Fixed shape; every removed instance is replaced one for one.
#[derive(Debug, Clone, Default)]
pub struct NaiveStrategy {
    shape: Vec<PoolRequirement>,
}

impl NaiveStrategy {
    pub fn new(shape: Vec<PoolRequirement>) -> Self {
        Self { shape }
    }
}

#[async_trait]
impl PoolingStrategy for NaiveStrategy {
    async fn required_instances(&self) -> Vec<PoolRequirement> {
        self.shape.clone()
    }

    async fn notify_of_removal(
        &self,
        provider_id: &str,
        instance_type: &str,
    ) -> Option<PoolRequirement> {
        debug!(provider_id = %provider_id, instance_type = %instance_type, "Replacing removed pool instance");
        Some(PoolRequirement::new(instance_type, 1))
    }
}
