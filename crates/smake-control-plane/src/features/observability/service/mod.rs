use crate::features::observability::repo::ObservabilityRepository;
use crate::shared::error::{ControlPlaneError, ControlPlaneResult};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingOutcome {
    Ready,
    Failed,
    Conflict,
    Fatal,
}

impl PollingOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollingOutcome::Ready => "ready",
            PollingOutcome::Failed => "failed",
            PollingOutcome::Conflict => "conflict",
            PollingOutcome::Fatal => "fatal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolAction {
    Create,
    Terminate,
    Claim,
}

impl PoolAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolAction::Create => "create",
            PoolAction::Terminate => "terminate",
            PoolAction::Claim => "claim",
        }
    }
}

/// Metrics handle shared by the lifecycle adapter and the pool reconciler.
/// Each instance owns its own registry.
#[derive(Clone)]
pub struct ObservabilityService {
    repo: Arc<ObservabilityRepository>,
}

impl ObservabilityService {
    pub fn new(repo: Arc<ObservabilityRepository>) -> Self {
        Self { repo }
    }

    pub fn with_registry() -> ControlPlaneResult<Self> {
        let repo = ObservabilityRepository::new()
            .map_err(|e| ControlPlaneError::Internal(format!("metrics registry: {e}")))?;
        Ok(Self::new(Arc::new(repo)))
    }

    pub fn record_provisioned(&self) {
        self.repo.inc_instances_provisioned();
    }

    pub fn record_polling_outcome(&self, outcome: PollingOutcome) {
        self.repo.inc_polling_outcome(outcome.as_str());
    }

    pub fn record_tag_failure(&self) {
        self.repo.inc_tag_failures();
    }

    pub fn record_pool_action(&self, action: PoolAction) {
        self.repo.inc_pool_action(action.as_str());
    }

    pub fn polling_outcomes(&self, outcome: PollingOutcome) -> u64 {
        self.repo.polling_outcomes(outcome.as_str())
    }

    pub fn pool_actions(&self, action: PoolAction) -> u64 {
        self.repo.pool_actions(action.as_str())
    }

    pub fn tag_failures(&self) -> u64 {
        self.repo.tag_failures()
    }

    pub fn instances_provisioned(&self) -> u64 {
        self.repo.instances_provisioned()
    }

    pub fn render_metrics(&self) -> ControlPlaneResult<String> {
        self.repo
            .render_metrics()
            .map_err(|e| ControlPlaneError::Internal(format!("metrics rendering: {e}")))
    }
}
