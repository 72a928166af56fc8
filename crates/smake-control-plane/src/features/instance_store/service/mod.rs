use crate::features::instance_store::repo::InstanceRepository;
use crate::shared::error::{ControlPlaneError, ControlPlaneResult};
use crate::shared::types::{Instance, InstanceFilter, InstanceSpec, InstanceState};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Optimistic-concurrency CRUD over instance records.
///
/// `update_instance` is the only path that changes a record's state or uri,
/// and it only succeeds when the caller holds the current revision.
#[derive(Clone)]
pub struct InstanceStore {
    repo: Arc<dyn InstanceRepository>,
    defaults: InstanceSpec,
}

impl InstanceStore {
    pub fn new(repo: Arc<dyn InstanceRepository>, defaults: InstanceSpec) -> Self {
        Self { repo, defaults }
    }

    /// Create a pending record, filling in the configured image and type
    /// where the caller gave none.
    pub async fn create_instance(
        &self,
        ami: Option<&str>,
        instance_type: Option<&str>,
    ) -> ControlPlaneResult<Instance> {
        let instance = Instance::new(
            ami.unwrap_or(&self.defaults.ami),
            instance_type.unwrap_or(&self.defaults.instance_type),
        );

        self.repo.create(instance.clone()).await.map_err(|e| match e {
            ControlPlaneError::StorageError(_) => e,
            other => ControlPlaneError::StorageError(other.to_string()),
        })?;

        info!(
            instance_id = %instance.id,
            ami = %instance.ami,
            instance_type = %instance.instance_type,
            "Instance record created"
        );

        Ok(instance)
    }

    pub async fn get_instance(&self, id: &str) -> ControlPlaneResult<Instance> {
        self.repo
            .find_one(id)
            .await?
            .ok_or_else(|| ControlPlaneError::InstanceNotFound(id.to_string()))
    }

    /// Like [`get_instance`](Self::get_instance) but absence is not an error.
    pub async fn find_instance(&self, id: &str) -> ControlPlaneResult<Option<Instance>> {
        self.repo.find_one(id).await
    }

    pub async fn get_all_instances(
        &self,
        filter: Option<&InstanceFilter>,
    ) -> ControlPlaneResult<Vec<Instance>> {
        let all = InstanceFilter::default();
        self.repo.find(filter.unwrap_or(&all)).await
    }

    pub async fn update_instance(&self, instance: Instance) -> ControlPlaneResult<Instance> {
        instance.validate()?;

        let id = instance.id.clone();
        let state = instance.state;
        match self.repo.update(instance).await {
            Ok(updated) => {
                debug!(instance_id = %id, state = %state, revision = updated.revision, "Instance record updated");
                Ok(updated)
            }
            Err(e) => {
                if e.is_concurrency() {
                    warn!(instance_id = %id, error = %e, "Rejected stale instance update");
                }
                Err(e)
            }
        }
    }

    /// Move the record `id` to `state` at whatever revision is stored now.
    ///
    /// `Ok(None)` when there is no record. A change the state table does not
    /// allow leaves the record as it is. Losing the write to a concurrent
    /// update re-reads the record and tries once more.
    pub async fn transition_instance(
        &self,
        id: &str,
        state: InstanceState,
    ) -> ControlPlaneResult<Option<Instance>> {
        let mut retried = false;
        loop {
            let Some(current) = self.find_instance(id).await? else {
                debug!(instance_id = %id, state = %state, "No instance record, skipping bookkeeping");
                return Ok(None);
            };

            if !current.state.can_transition_to(state) {
                warn!(instance_id = %id, from = %current.state, to = %state, "Skipping disallowed state change");
                return Ok(Some(current));
            }

            let uri = if state.allows_uri() {
                current.uri.clone()
            } else {
                None
            };
            match self.update_instance(current.with_state(state, uri)).await {
                Err(e) if e.is_concurrency() && !retried => {
                    retried = true;
                    debug!(instance_id = %id, state = %state, "Record moved underneath us, re-reading");
                }
                result => return result.map(Some),
            }
        }
    }
}
