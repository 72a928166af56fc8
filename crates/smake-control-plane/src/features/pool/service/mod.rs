use crate::config::PoolSettings;
use crate::features::lifecycle::service::LifecycleService;
use crate::features::observability::service::{ObservabilityService, PoolAction};
use crate::features::pool::repo::PoolingStrategy;
use crate::shared::error::{ControlPlaneError, ControlPlaneResult};
use crate::shared::types::{ProviderInstance, ProviderInstanceState, Tag};
use chrono::{DateTime, Utc};
use serde::Serialize;
use smake_providers::{
    ComputeProvider, DescribeInstancesRequest, Filter, ProviderError, RunInstancesRequest,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolMember {
    pub provider_id: String,
    pub instance_type: String,
    pub state: ProviderInstanceState,
    pub launch_time: DateTime<Utc>,
}

impl From<ProviderInstance> for PoolMember {
    fn from(instance: ProviderInstance) -> Self {
        Self {
            provider_id: instance.instance_id,
            instance_type: instance.instance_type,
            state: instance.state,
            launch_time: instance.launch_time,
        }
    }
}

/// Pool members currently visible at the provider, grouped by type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    by_type: BTreeMap<String, Vec<PoolMember>>,
}

impl PoolSnapshot {
    pub fn from_members(members: impl IntoIterator<Item = PoolMember>) -> Self {
        let mut by_type: BTreeMap<String, Vec<PoolMember>> = BTreeMap::new();
        for member in members {
            by_type
                .entry(member.instance_type.clone())
                .or_default()
                .push(member);
        }
        Self { by_type }
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }

    pub fn total(&self) -> usize {
        self.by_type.values().map(Vec::len).sum()
    }

    pub fn count(&self, instance_type: &str) -> usize {
        self.members(instance_type).len()
    }

    pub fn members(&self, instance_type: &str) -> &[PoolMember] {
        self.by_type
            .get(instance_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.by_type.keys().map(String::as_str)
    }

    /// The `n` newest members of `instance_type`.
    pub fn newest(&self, instance_type: &str, n: usize) -> Vec<PoolMember> {
        let mut members = self.members(instance_type).to_vec();
        members.sort_by(|a, b| {
            b.launch_time
                .cmp(&a.launch_time)
                .then_with(|| b.provider_id.cmp(&a.provider_id))
        });
        members.truncate(n);
        members
    }
}

/// The member a claim takes: the oldest running one, else the oldest pending.
pub fn claim_candidate(members: &[PoolMember]) -> Option<&PoolMember> {
    let oldest = |state: ProviderInstanceState| {
        members
            .iter()
            .filter(|m| m.state == state)
            .min_by(|a, b| {
                a.launch_time
                    .cmp(&b.launch_time)
                    .then_with(|| a.provider_id.cmp(&b.provider_id))
            })
    };
    oldest(ProviderInstanceState::Running).or_else(|| oldest(ProviderInstanceState::Pending))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileFailure {
    pub instance_type: String,
    pub action: String,
    pub error: String,
}

/// What one reconciliation pass issued.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub created: Vec<String>,
    pub terminated: Vec<String>,
    pub failures: Vec<ReconcileFailure>,
}

impl ReconcileReport {
    fn fail(&mut self, instance_type: &str, action: &str, error: impl ToString) {
        self.failures.push(ReconcileFailure {
            instance_type: instance_type.to_string(),
            action: action.to_string(),
            error: error.to_string(),
        });
    }
}

/// Keeps the provider-side pool in the shape the strategy asks for.
///
/// Terminations go through the lifecycle adapter so that instances with a
/// stored record stop reading as ready.
#[derive(Clone)]
pub struct PoolReconciler {
    provider: Arc<dyn ComputeProvider>,
    lifecycle: LifecycleService,
    strategy: Arc<dyn PoolingStrategy>,
    settings: PoolSettings,
    metrics: ObservabilityService,
}

impl PoolReconciler {
    pub fn new(
        provider: Arc<dyn ComputeProvider>,
        lifecycle: LifecycleService,
        strategy: Arc<dyn PoolingStrategy>,
        settings: PoolSettings,
        metrics: ObservabilityService,
    ) -> Self {
        Self {
            provider,
            lifecycle,
            strategy,
            settings,
            metrics,
        }
    }

    /// Diff the required shape against the observed pool and issue the
    /// creates and terminates that close the gap.
    ///
    /// Returns once every call has been issued; readiness and termination
    /// are not awaited. Types present in the pool but absent from the
    /// required shape are left alone.
    pub async fn initialize(&self) -> ControlPlaneResult<ReconcileReport> {
        let required = self.strategy.required_instances().await;
        let snapshot = self.pool_snapshot().await?;
        let mut report = ReconcileReport::default();

        if snapshot.is_empty() {
            info!(types = required.len(), "Pool is empty, creating it from scratch");
            for requirement in &required {
                self.create_many(&requirement.instance_type, requirement.count, &mut report)
                    .await;
            }
            return Ok(report);
        }

        for requirement in &required {
            let present = snapshot.count(&requirement.instance_type);
            let wanted = requirement.count as usize;
            debug!(instance_type = %requirement.instance_type, present, wanted, "Reconciling pool type");

            if wanted > present {
                self.create_many(
                    &requirement.instance_type,
                    (wanted - present) as u32,
                    &mut report,
                )
                .await;
            } else if wanted < present {
                for member in snapshot.newest(&requirement.instance_type, present - wanted) {
                    match self.terminate(&member.provider_id).await {
                        Ok(()) => report.terminated.push(member.provider_id),
                        Err(e) => {
                            error!(provider_id = %member.provider_id, error = %e, "Failed to terminate surplus pool instance");
                            report.fail(&requirement.instance_type, "terminate", e);
                        }
                    }
                }
            }
        }

        info!(
            created = report.created.len(),
            terminated = report.terminated.len(),
            failures = report.failures.len(),
            "Pool reconciliation issued"
        );
        Ok(report)
    }

    async fn create_many(&self, instance_type: &str, count: u32, report: &mut ReconcileReport) {
        for _ in 0..count {
            match self.create(instance_type).await {
                Ok(Some(provider_id)) => report.created.push(provider_id),
                Ok(None) => report.fail(instance_type, "tag", "pool tag could not be applied"),
                Err(e) => {
                    error!(instance_type = %instance_type, error = %e, "Failed to create pool instance");
                    report.fail(instance_type, "create", e);
                }
            }
        }
    }

    /// Launch one pool instance of `instance_type` and tag it into the pool.
    ///
    /// `Ok(None)` means the instance was launched but never tagged.
    pub async fn create(&self, instance_type: &str) -> ControlPlaneResult<Option<String>> {
        let image_id = self.settings.image_for(instance_type).to_string();
        let reservation = self
            .provider
            .run_instances(RunInstancesRequest::single(image_id.clone(), instance_type))
            .await?;

        let provider_id = reservation
            .instances
            .into_iter()
            .next()
            .map(|instance| instance.instance_id)
            .ok_or_else(|| {
                ProviderError::MalformedResponse("run_instances returned no instances".to_string())
            })?;

        self.metrics.record_pool_action(PoolAction::Create);
        info!(provider_id = %provider_id, instance_type = %instance_type, image_id = %image_id, "Pool instance launched");

        Ok(self
            .apply_tags(&[self.settings.tags.pool_tag()], &provider_id)
            .await)
    }

    /// Tag `provider_id`, retrying immediately up to the configured number of
    /// attempts. `None` once every attempt has failed.
    pub async fn apply_tags(&self, tags: &[Tag], provider_id: &str) -> Option<String> {
        let resources = [provider_id.to_string()];
        for attempt in 1..=self.settings.tag_attempts {
            match self.provider.create_tags(&resources, tags).await {
                Ok(()) => {
                    debug!(provider_id = %provider_id, attempt, "Tags applied");
                    return Some(provider_id.to_string());
                }
                Err(e) => {
                    self.metrics.record_tag_failure();
                    warn!(provider_id = %provider_id, attempt, error = %e, "Tagging attempt failed");
                }
            }
        }

        error!(provider_id = %provider_id, attempts = self.settings.tag_attempts, "Giving up on tagging");
        None
    }

    /// Issue a terminate without waiting for it to finish. A stored record
    /// behind the instance is moved to `terminating`.
    pub async fn terminate(&self, provider_id: &str) -> ControlPlaneResult<()> {
        let record = self.lifecycle.begin_termination(provider_id).await?;
        self.metrics.record_pool_action(PoolAction::Terminate);
        info!(
            provider_id = %provider_id,
            instance_id = record.as_ref().map(|r| r.id.as_str()).unwrap_or("-"),
            "Pool instance termination issued"
        );
        Ok(())
    }

    pub async fn remove_from_pool(&self, provider_id: &str) -> ControlPlaneResult<()> {
        self.provider
            .delete_tags(&[provider_id.to_string()], &[self.settings.tags.pool_tag_key()])
            .await?;
        Ok(())
    }

    /// Take one instance of `instance_type` out of the pool and hand back its
    /// provider id. The strategy decides whether a replacement is launched.
    pub async fn get_instance(&self, instance_type: &str) -> ControlPlaneResult<String> {
        let members = self.pool_instances_by_type(instance_type).await?;
        let provider_id = claim_candidate(&members)
            .map(|member| member.provider_id.clone())
            .ok_or_else(|| ControlPlaneError::PoolExhausted(instance_type.to_string()))?;

        self.remove_from_pool(&provider_id).await?;
        self.metrics.record_pool_action(PoolAction::Claim);
        info!(provider_id = %provider_id, instance_type = %instance_type, "Pool instance claimed");

        if let Some(replacement) = self
            .strategy
            .notify_of_removal(&provider_id, instance_type)
            .await
        {
            for _ in 0..replacement.count {
                if let Err(e) = self.create(&replacement.instance_type).await {
                    warn!(instance_type = %replacement.instance_type, error = %e, "Failed to launch replacement");
                }
            }
        }

        Ok(provider_id)
    }

    fn pool_filters(&self) -> Vec<Filter> {
        let tags = &self.settings.tags;
        vec![
            Filter::tag_key(tags.pool_key.clone()),
            Filter::tag_value(tags.pool_value.clone()),
            Filter::instance_state(&[
                ProviderInstanceState::Running,
                ProviderInstanceState::Pending,
            ]),
        ]
    }

    async fn describe_pool(&self, filters: Vec<Filter>) -> ControlPlaneResult<Vec<PoolMember>> {
        let reservations = self
            .provider
            .describe_instances(DescribeInstancesRequest::by_filters(filters))
            .await?;
        Ok(reservations
            .into_iter()
            .flat_map(|reservation| reservation.instances)
            .map(PoolMember::from)
            .collect())
    }

    pub async fn pool_snapshot(&self) -> ControlPlaneResult<PoolSnapshot> {
        let members = self.describe_pool(self.pool_filters()).await?;
        Ok(PoolSnapshot::from_members(members))
    }

    pub async fn pool_instances_by_type(
        &self,
        instance_type: &str,
    ) -> ControlPlaneResult<Vec<PoolMember>> {
        let mut filters = self.pool_filters();
        filters.push(Filter::instance_type(instance_type));
        self.describe_pool(filters).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LifecycleSettings;
    use crate::features::instance_store::repo::InMemoryInstanceRepository;
    use crate::features::instance_store::service::InstanceStore;
    use crate::features::lifecycle::repo::ProviderGateway;
    use crate::features::pool::repo::NaiveStrategy;
    use crate::shared::types::{InstanceSpec, InstanceState, PoolRequirement, SecurityOptions};
    use async_trait::async_trait;
    use mockall::mock;
    use mockall::predicate::eq;
    use smake_providers::simulated::ProviderCall;
    use smake_providers::SimulatedCloud;

    mock! {
        pub Strategy {}

        #[async_trait]
        impl PoolingStrategy for Strategy {
            async fn required_instances(&self) -> Vec<PoolRequirement>;
            async fn notify_of_removal(
                &self,
                provider_id: &str,
                instance_type: &str,
            ) -> Option<PoolRequirement>;
        }
    }

    struct Harness {
        cloud: SimulatedCloud,
        metrics: ObservabilityService,
        lifecycle: LifecycleService,
        reconciler: PoolReconciler,
    }

    fn harness_with(strategy: Arc<dyn PoolingStrategy>, settings: PoolSettings) -> Harness {
        let cloud = SimulatedCloud::new();
        let metrics = ObservabilityService::with_registry().unwrap();
        let store = InstanceStore::new(
            Arc::new(InMemoryInstanceRepository::new()),
            InstanceSpec::default(),
        );
        let lifecycle_settings = LifecycleSettings::default();
        let lifecycle = LifecycleService::new(
            store,
            ProviderGateway::new(Arc::new(cloud.clone()), lifecycle_settings.tags.clone()),
            Arc::new(cloud.clone()),
            lifecycle_settings,
            metrics.clone(),
        );
        let reconciler = PoolReconciler::new(
            Arc::new(cloud.clone()),
            lifecycle.clone(),
            strategy,
            settings,
            metrics.clone(),
        );
        Harness {
            cloud,
            metrics,
            lifecycle,
            reconciler,
        }
    }

    fn harness(shape: &[(&str, u32)]) -> Harness {
        let shape = shape
            .iter()
            .map(|(ty, count)| PoolRequirement::new(*ty, *count))
            .collect();
        harness_with(Arc::new(NaiveStrategy::new(shape)), PoolSettings::default())
    }

    fn pool_tag() -> Tag {
        Tag::new("smake", "pool")
    }

    fn minutes_ago(minutes: i64) -> DateTime<Utc> {
        Utc::now() - chrono::Duration::minutes(minutes)
    }

    async fn seed_pool(h: &Harness, ty: &str, state: ProviderInstanceState, age: i64) -> String {
        h.cloud
            .seed_instance_launched_at(ty, state, vec![pool_tag()], minutes_ago(age))
            .await
    }

    fn count_calls(calls: &[ProviderCall], pred: impl Fn(&ProviderCall) -> bool) -> usize {
        calls.iter().filter(|call| pred(call)).count()
    }

    #[tokio::test]
    async fn test_empty_pool_is_created_from_scratch() {
        let h = harness(&[("t2.micro", 2), ("t2.large", 1)]);

        let report = h.reconciler.initialize().await.unwrap();
        assert_eq!(report.created.len(), 3);
        assert!(report.terminated.is_empty());
        assert!(report.failures.is_empty());

        let snapshot = h.reconciler.pool_snapshot().await.unwrap();
        assert_eq!(snapshot.count("t2.micro"), 2);
        assert_eq!(snapshot.count("t2.large"), 1);
        assert_eq!(h.metrics.pool_actions(PoolAction::Create), 3);
    }

    #[tokio::test]
    async fn test_missing_instances_are_created() {
        let h = harness(&[("t2.micro", 3)]);
        seed_pool(&h, "t2.micro", ProviderInstanceState::Running, 10).await;

        let report = h.reconciler.initialize().await.unwrap();

        let calls = h.cloud.calls().await;
        assert_eq!(
            count_calls(&calls, |c| matches!(c, ProviderCall::RunInstances(_))),
            2
        );
        assert_eq!(
            count_calls(&calls, |c| matches!(c, ProviderCall::TerminateInstances(_))),
            0
        );
        assert_eq!(report.created.len(), 2);
    }

    #[tokio::test]
    async fn test_surplus_newest_instances_are_terminated() {
        let h = harness(&[("t2.micro", 1)]);
        let oldest = seed_pool(&h, "t2.micro", ProviderInstanceState::Running, 30).await;
        let middle = seed_pool(&h, "t2.micro", ProviderInstanceState::Running, 20).await;
        let newest = seed_pool(&h, "t2.micro", ProviderInstanceState::Pending, 10).await;

        let report = h.reconciler.initialize().await.unwrap();
        assert_eq!(report.terminated, vec![newest.clone(), middle.clone()]);
        assert!(report.created.is_empty());

        let calls = h.cloud.calls().await;
        let terminated: Vec<String> = calls
            .iter()
            .filter_map(|call| match call {
                ProviderCall::TerminateInstances(ids) => Some(ids.clone()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(terminated.len(), 2);
        assert!(!terminated.contains(&oldest));
        assert!(terminated.iter().all(|id| *id == newest || *id == middle));
    }

    #[tokio::test]
    async fn test_surplus_termination_updates_stored_records() {
        let h = harness(&[("t2.micro", 1)]);
        let mut ready = Vec::new();
        for _ in 0..2 {
            let launched = h
                .lifecycle
                .run_instances(InstanceSpec::default(), &SecurityOptions::default())
                .await
                .unwrap();
            let polled = tokio_test::assert_ok!(
                h.lifecycle.polling_outcome(&launched.id).await.unwrap()
            );
            assert_eq!(polled.state, InstanceState::Ready);
            ready.push(polled);
        }

        let report = h.reconciler.initialize().await.unwrap();
        assert_eq!(report.terminated.len(), 1);
        let victim = h.cloud.instance(&report.terminated[0]).await.unwrap();
        assert_eq!(victim.state, ProviderInstanceState::Terminated);
        let victim_id = victim.tag_value("ID").unwrap().to_string();

        let store = h.lifecycle.store();
        let terminated = store.get_instance(&victim_id).await.unwrap();
        assert_eq!(terminated.state, InstanceState::Terminating);
        assert!(terminated.uri.is_none());

        let survivor = ready.iter().find(|r| r.id != victim_id).unwrap();
        assert_eq!(store.get_instance(&survivor.id).await.unwrap(), *survivor);
        assert_eq!(h.metrics.pool_actions(PoolAction::Terminate), 1);
    }

    #[tokio::test]
    async fn test_types_outside_shape_are_left_alone() {
        let h = harness(&[("t2.micro", 1)]);
        seed_pool(&h, "t2.micro", ProviderInstanceState::Running, 5).await;
        seed_pool(&h, "t2.large", ProviderInstanceState::Running, 5).await;

        let report = h.reconciler.initialize().await.unwrap();
        assert_eq!(report, ReconcileReport::default());
    }

    #[tokio::test]
    async fn test_stopped_and_untagged_instances_are_not_pool_members() {
        let h = harness(&[("t2.micro", 1)]);
        h.cloud
            .seed_instance("t2.micro", ProviderInstanceState::Running, vec![])
            .await;
        seed_pool(&h, "t2.micro", ProviderInstanceState::Stopped, 5).await;

        assert!(h.reconciler.pool_snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_creates_do_not_abort_the_pass() {
        let h = harness(&[("t2.large", 1), ("t2.micro", 1)]);
        h.cloud.reject_instance_type("t2.large").await;

        let report = h.reconciler.initialize().await.unwrap();
        assert_eq!(report.created.len(), 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].instance_type, "t2.large");
        assert_eq!(report.failures[0].action, "create");
        assert!(report.failures[0].error.contains("InvalidParameterValue"));
    }

    #[tokio::test]
    async fn test_tagging_gives_up_after_three_attempts() {
        let h = harness(&[]);
        let provider_id = h
            .cloud
            .seed_instance("t2.micro", ProviderInstanceState::Running, vec![])
            .await;
        h.cloud.fail_tagging_always().await;

        let result = h.reconciler.apply_tags(&[pool_tag()], &provider_id).await;
        assert!(result.is_none());

        let calls = h.cloud.calls().await;
        assert_eq!(
            count_calls(&calls, |c| matches!(c, ProviderCall::CreateTags { .. })),
            3
        );
        assert_eq!(h.metrics.tag_failures(), 3);
    }

    #[tokio::test]
    async fn test_tagging_succeeds_on_last_attempt() {
        let h = harness(&[]);
        let provider_id = h
            .cloud
            .seed_instance("t2.micro", ProviderInstanceState::Running, vec![])
            .await;
        h.cloud.fail_tagging(2).await;

        let result = h.reconciler.apply_tags(&[pool_tag()], &provider_id).await;
        assert_eq!(result, Some(provider_id.clone()));
        assert_eq!(
            h.cloud.instance(&provider_id).await.unwrap().tag_value("smake"),
            Some("pool")
        );
    }

    #[tokio::test]
    async fn test_untagged_create_is_reported() {
        let h = harness(&[("t2.micro", 1)]);
        h.cloud.fail_tagging_always().await;

        let report = h.reconciler.initialize().await.unwrap();
        assert!(report.created.is_empty());
        assert_eq!(report.failures[0].action, "tag");
    }

    #[tokio::test]
    async fn test_create_uses_catalog_image() {
        let mut settings = PoolSettings::default();
        settings
            .image_catalog
            .insert("t2.large".to_string(), "ami-0000beef".to_string());
        let h = harness_with(Arc::new(NaiveStrategy::default()), settings);

        let large = h.reconciler.create("t2.large").await.unwrap().unwrap();
        let micro = h.reconciler.create("t2.micro").await.unwrap().unwrap();

        assert_eq!(h.cloud.instance(&large).await.unwrap().image_id, "ami-0000beef");
        assert_eq!(h.cloud.instance(&micro).await.unwrap().image_id, "ami-d05e75b8");
    }

    #[tokio::test]
    async fn test_get_instance_prefers_running_and_replaces() {
        let h = harness(&[("t2.micro", 2)]);
        seed_pool(&h, "t2.micro", ProviderInstanceState::Pending, 30).await;
        let running = seed_pool(&h, "t2.micro", ProviderInstanceState::Running, 5).await;

        let claimed = h.reconciler.get_instance("t2.micro").await.unwrap();
        assert_eq!(claimed, running);
        assert_eq!(
            h.cloud.instance(&claimed).await.unwrap().tag_value("smake"),
            None
        );

        // one pending left plus the replacement
        let members = h.reconciler.pool_instances_by_type("t2.micro").await.unwrap();
        assert_eq!(members.len(), 2);
        assert!(members.iter().all(|m| m.provider_id != claimed));
        assert_eq!(h.metrics.pool_actions(PoolAction::Claim), 1);
    }

    #[tokio::test]
    async fn test_get_instance_without_replacement() {
        let mut strategy = MockStrategy::new();
        strategy
            .expect_notify_of_removal()
            .with(eq("i-00000000000000001"), eq("t2.micro"))
            .times(1)
            .returning(|_, _| None);
        let h = harness_with(Arc::new(strategy), PoolSettings::default());
        seed_pool(&h, "t2.micro", ProviderInstanceState::Running, 5).await;

        let claimed = h.reconciler.get_instance("t2.micro").await.unwrap();
        assert_eq!(claimed, "i-00000000000000001");
        assert!(!h
            .cloud
            .calls()
            .await
            .iter()
            .any(|c| matches!(c, ProviderCall::RunInstances(_))));
    }

    #[tokio::test]
    async fn test_get_instance_from_empty_pool() {
        let h = harness(&[("t2.micro", 1)]);
        let err = h.reconciler.get_instance("t2.micro").await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::PoolExhausted(_)));
    }

    #[test]
    fn test_claim_candidate_order() {
        let member = |id: &str, state, age| PoolMember {
            provider_id: id.to_string(),
            instance_type: "t2.micro".to_string(),
            state,
            launch_time: minutes_ago(age),
        };

        let members = vec![
            member("i-3", ProviderInstanceState::Pending, 50),
            member("i-2", ProviderInstanceState::Running, 10),
            member("i-1", ProviderInstanceState::Running, 20),
        ];
        assert_eq!(claim_candidate(&members).unwrap().provider_id, "i-1");

        let pending_only = vec![
            member("i-5", ProviderInstanceState::Pending, 5),
            member("i-4", ProviderInstanceState::Pending, 15),
        ];
        assert_eq!(claim_candidate(&pending_only).unwrap().provider_id, "i-4");
        assert!(claim_candidate(&[]).is_none());
    }
}
