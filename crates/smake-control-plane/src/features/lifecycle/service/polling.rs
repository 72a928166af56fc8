use crate::shared::error::{ControlPlaneError, ControlPlaneResult};
use crate::shared::types::Instance;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

type PollingHandle = JoinHandle<ControlPlaneResult<Instance>>;

/// Tracks in-flight readiness polling tasks by domain id.
///
/// Tasks run to completion on their own; the supervisor only keeps the
/// handle so a caller can collect the outcome later.
#[derive(Clone, Default)]
pub struct PollingSupervisor {
    tasks: Arc<Mutex<HashMap<String, PollingHandle>>>,
}

impl PollingSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn track(&self, instance_id: String, handle: PollingHandle) {
        let mut tasks = self.tasks.lock().await;
        if tasks.insert(instance_id.clone(), handle).is_some() {
            // Replaced handle's task keeps running detached.
            debug!(instance_id = %instance_id, "Superseded earlier polling task");
        }
    }

    pub async fn is_tracking(&self, instance_id: &str) -> bool {
        self.tasks.lock().await.contains_key(instance_id)
    }

    pub async fn tracked(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Waits for the tracked task of `instance_id` and returns its result.
    /// `None` when nothing is tracked for that id.
    pub async fn outcome(&self, instance_id: &str) -> Option<ControlPlaneResult<Instance>> {
        let handle = self.tasks.lock().await.remove(instance_id)?;
        Some(match handle.await {
            Ok(result) => result,
            Err(e) => Err(ControlPlaneError::Internal(format!(
                "polling task for {instance_id} did not complete: {e}"
            ))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::types::InstanceState;

    #[tokio::test]
    async fn test_outcome_returns_task_result_once() {
        let supervisor = PollingSupervisor::new();
        let instance = Instance::new("ami-d05e75b8", "t2.micro");
        let id = instance.id.clone();

        let ready = instance.with_state(InstanceState::Ready, Some("https://203.0.113.2".into()));
        supervisor
            .track(id.clone(), tokio::spawn(async move { Ok::<_, ControlPlaneError>(ready) }))
            .await;
        assert!(supervisor.is_tracking(&id).await);

        let outcome = supervisor.outcome(&id).await.unwrap().unwrap();
        assert_eq!(outcome.state, InstanceState::Ready);
        assert!(supervisor.outcome(&id).await.is_none());
        assert_eq!(supervisor.tracked().await, 0);
    }

    async fn explode() -> ControlPlaneResult<Instance> {
        panic!("probe exploded")
    }

    #[tokio::test]
    async fn test_panicked_task_is_internal_error() {
        let supervisor = PollingSupervisor::new();
        supervisor
            .track("boom".to_string(), tokio::spawn(explode()))
            .await;

        let err = supervisor.outcome("boom").await.unwrap().unwrap_err();
        assert!(matches!(err, ControlPlaneError::Internal(_)));
    }
}
