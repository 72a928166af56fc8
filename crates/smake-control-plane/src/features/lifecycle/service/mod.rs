mod polling;

pub use polling::PollingSupervisor;

use crate::config::LifecycleSettings;
use crate::features::instance_store::service::InstanceStore;
use crate::features::lifecycle::repo::ProviderGateway;
use crate::features::observability::service::{ObservabilityService, PollingOutcome};
use crate::shared::error::{ControlPlaneError, ControlPlaneResult};
use crate::shared::types::{
    Instance, InstanceSpec, InstanceState, ProviderInstance, SecurityGroupChoice, SecurityOptions,
};
use smake_providers::{
    codes, IpPermission, ProbeTarget, ReachabilityProbe, RunInstancesRequest, WaitTarget,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const SECURITY_GROUP_DESCRIPTION: &str = "smake managed instance access";

/// Drives provider-side instances through their lifecycle and keeps the
/// instance store in step with them.
#[derive(Clone)]
pub struct LifecycleService {
    store: InstanceStore,
    gateway: ProviderGateway,
    probe: Arc<dyn ReachabilityProbe>,
    settings: LifecycleSettings,
    metrics: ObservabilityService,
    polling: PollingSupervisor,
}

impl LifecycleService {
    pub fn new(
        store: InstanceStore,
        gateway: ProviderGateway,
        probe: Arc<dyn ReachabilityProbe>,
        settings: LifecycleSettings,
        metrics: ObservabilityService,
    ) -> Self {
        Self {
            store,
            gateway,
            probe,
            settings,
            metrics,
            polling: PollingSupervisor::new(),
        }
    }

    pub fn store(&self) -> &InstanceStore {
        &self.store
    }

    pub fn polling(&self) -> &PollingSupervisor {
        &self.polling
    }

    /// Launch one instance and return its pending record straight away.
    ///
    /// Readiness polling continues in the background; its result is
    /// available through [`polling_outcome`](Self::polling_outcome).
    pub async fn run_instances(
        &self,
        spec: InstanceSpec,
        options: &SecurityOptions,
    ) -> ControlPlaneResult<Instance> {
        let choice = options.choice()?;
        let security_group = self.resolve_security_group(choice).await?;

        let record = self
            .store
            .create_instance(Some(&spec.ami), Some(&spec.instance_type))
            .await?;

        let mut request = RunInstancesRequest::single(spec.ami, spec.instance_type);
        request.security_groups = vec![security_group.clone()];
        request.key_name = self.settings.key_name.clone();
        request.tags = vec![
            self.gateway.tags().domain_id_tag(&record.id),
            self.gateway.tags().pool_tag(),
        ];

        let reservation = match self.gateway.provider().run_instances(request).await {
            Ok(reservation) => reservation,
            Err(e) => {
                error!(instance_id = %record.id, error = %e, "Provider rejected instance launch");
                if let Err(mark_err) = self
                    .store
                    .update_instance(record.with_state(InstanceState::Failed, None))
                    .await
                {
                    warn!(instance_id = %record.id, error = %mark_err, "Could not mark launch failure");
                }
                return Err(e.into());
            }
        };

        self.metrics.record_provisioned();
        info!(
            instance_id = %record.id,
            provider_ids = ?reservation.instances.iter().map(|i| i.instance_id.as_str()).collect::<Vec<_>>(),
            security_group = %security_group,
            "Instance launched"
        );

        self.spawn_polling(record.clone()).await;
        Ok(record)
    }

    async fn resolve_security_group(&self, choice: SecurityGroupChoice) -> ControlPlaneResult<String> {
        match choice {
            SecurityGroupChoice::Create(name) => {
                self.create_security_group(&name).await?;
                Ok(name)
            }
            SecurityGroupChoice::Existing(name) => {
                self.gateway
                    .provider()
                    .describe_security_groups(&[name.clone()])
                    .await?;
                Ok(name)
            }
            SecurityGroupChoice::Default => {
                let name = self.settings.default_security_group.clone();
                match self
                    .gateway
                    .provider()
                    .describe_security_groups(&[name.clone()])
                    .await
                {
                    Ok(_) => Ok(name),
                    Err(e) if e.is_code(codes::INVALID_GROUP_NOT_FOUND) => {
                        info!(security_group = %name, "Default security group missing, creating it");
                        self.create_security_group(&name).await?;
                        Ok(name)
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    /// New groups get exactly one rule: ssh from anywhere.
    async fn create_security_group(&self, name: &str) -> ControlPlaneResult<()> {
        let provider = self.gateway.provider();
        let group_id = provider
            .create_security_group(name, SECURITY_GROUP_DESCRIPTION)
            .await?;
        provider
            .authorize_security_group_ingress(&group_id, name, vec![IpPermission::ssh_from_anywhere()])
            .await?;

        info!(security_group = %name, group_id = %group_id, "Security group created");
        Ok(())
    }

    async fn spawn_polling(&self, instance: Instance) {
        let service = self.clone();
        let instance_id = instance.id.clone();
        let handle = tokio::spawn(async move { service.begin_polling(instance).await });
        self.polling.track(instance_id, handle).await;
    }

    /// One readiness attempt for `instance`, written back with the revision
    /// the caller holds.
    ///
    /// Losing the write to a concurrent update is not an error: the record
    /// as it is now stored is returned instead.
    pub async fn begin_polling(&self, instance: Instance) -> ControlPlaneResult<Instance> {
        let result = self.poll_once(&instance).await;
        if let Err(e) = &result {
            self.metrics.record_polling_outcome(PollingOutcome::Fatal);
            error!(instance_id = %instance.id, error = %e, "Readiness polling failed");
        }
        result
    }

    async fn poll_once(&self, instance: &Instance) -> ControlPlaneResult<Instance> {
        let provider_id = self.gateway.resolve_provider_id(&instance.id).await?;

        let (update, outcome) = match self
            .probe
            .wait_until_reachable(&ProbeTarget::new(&provider_id))
            .await
        {
            Ok(()) => {
                let address = self.gateway.public_ip_address(&provider_id).await?;
                (
                    instance.with_state(InstanceState::Ready, Some(format!("https://{address}"))),
                    PollingOutcome::Ready,
                )
            }
            Err(e) => {
                warn!(instance_id = %instance.id, provider_id = %provider_id, error = %e, "Instance never became reachable");
                (
                    instance.with_state(InstanceState::Failed, None),
                    PollingOutcome::Failed,
                )
            }
        };

        match self.store.update_instance(update).await {
            Ok(updated) => {
                self.metrics.record_polling_outcome(outcome);
                info!(instance_id = %updated.id, state = %updated.state, "Readiness polling finished");
                Ok(updated)
            }
            Err(e) if e.is_concurrency() => {
                self.metrics.record_polling_outcome(PollingOutcome::Conflict);
                info!(instance_id = %instance.id, "Instance changed while polling, keeping stored record");
                self.store.get_instance(&instance.id).await
            }
            Err(e) => Err(e),
        }
    }

    /// Result of the background polling task for `instance_id`, once it
    /// finishes. `None` when no task is tracked.
    pub async fn polling_outcome(&self, instance_id: &str) -> Option<ControlPlaneResult<Instance>> {
        self.polling.outcome(instance_id).await
    }

    pub async fn describe_instance(&self, provider_id: &str) -> ControlPlaneResult<Vec<ProviderInstance>> {
        Ok(self.gateway.describe(provider_id).await?)
    }

    pub async fn get_public_ip_address(&self, provider_id: &str) -> ControlPlaneResult<String> {
        Ok(self.gateway.public_ip_address(provider_id).await?)
    }

    pub async fn start_instances(&self, instance: &Instance) -> ControlPlaneResult<Option<Instance>> {
        let provider_id = self.gateway.resolve_provider_id(&instance.id).await?;
        self.gateway
            .provider()
            .start_instances(&[provider_id.clone()])
            .await?;
        self.wait_for(WaitTarget::InstanceRunning, &instance.id).await?;
        info!(instance_id = %instance.id, provider_id = %provider_id, "Instance started");

        let record = self.record_state(&instance.id, InstanceState::Pending).await?;
        match &record {
            Some(pending) if pending.state == InstanceState::Pending => {
                self.spawn_polling(pending.clone()).await;
            }
            _ => debug!(instance_id = %instance.id, "No pending record to poll"),
        }
        Ok(record)
    }

    pub async fn stop_instances(&self, instance: &Instance) -> ControlPlaneResult<Option<Instance>> {
        let provider_id = self.gateway.resolve_provider_id(&instance.id).await?;
        self.gateway
            .provider()
            .stop_instances(&[provider_id.clone()])
            .await?;
        self.wait_for(WaitTarget::InstanceStopped, &instance.id).await?;
        info!(instance_id = %instance.id, provider_id = %provider_id, "Instance stopped");

        self.record_state(&instance.id, InstanceState::Stopped).await
    }

    pub async fn terminate_instances(&self, instance_id: &str) -> ControlPlaneResult<Option<Instance>> {
        let provider_id = self.gateway.resolve_provider_id(instance_id).await?;
        self.gateway
            .provider()
            .terminate_instances(&[provider_id.clone()])
            .await?;
        self.record_state(instance_id, InstanceState::Terminating)
            .await?;

        self.wait_for(WaitTarget::InstanceTerminated, instance_id)
            .await?;
        info!(instance_id = %instance_id, provider_id = %provider_id, "Instance terminated");

        self.record_state(instance_id, InstanceState::Terminated)
            .await
    }

    async fn wait_for(&self, target: WaitTarget, instance_id: &str) -> ControlPlaneResult<()> {
        self.gateway
            .provider()
            .wait_for(
                target,
                &self.gateway.domain_filters(instance_id),
                self.settings.wait_timeout,
            )
            .await
            .map(|_| ())
            .map_err(|e| {
                warn!(instance_id = %instance_id, waiter = target.waiter_name(), error = %e, "Wait did not complete");
                ControlPlaneError::from(e)
            })
    }

    /// Moves the stored record to `state`. Ids with no record (pool-only
    /// instances) are skipped.
    async fn record_state(
        &self,
        instance_id: &str,
        state: InstanceState,
    ) -> ControlPlaneResult<Option<Instance>> {
        self.store.transition_instance(instance_id, state).await
    }

    /// Issue a terminate and mark the record `terminating` without waiting
    /// for the provider to finish.
    pub async fn begin_termination(&self, provider_id: &str) -> ControlPlaneResult<Option<Instance>> {
        let domain_id = self.gateway.domain_id_of(provider_id).await?;
        self.gateway
            .provider()
            .terminate_instances(&[provider_id.to_string()])
            .await?;

        match domain_id {
            Some(domain_id) => {
                info!(instance_id = %domain_id, provider_id = %provider_id, "Instance termination issued");
                self.record_state(&domain_id, InstanceState::Terminating).await
            }
            None => {
                debug!(provider_id = %provider_id, "Instance carries no ID tag, skipping bookkeeping");
                Ok(None)
            }
        }
    }
}
