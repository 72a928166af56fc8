use crate::shared::error::{ControlPlaneError, ControlPlaneResult};
use crate::shared::types::{Instance, InstanceFilter};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Persistence capability behind the instance store
#[async_trait]
pub trait InstanceRepository: Send + Sync {
    /// Persist a new record. Fails if the id is already taken.
    async fn create(&self, instance: Instance) -> ControlPlaneResult<()>;

    /// Records matching `filter`
    async fn find(&self, filter: &InstanceFilter) -> ControlPlaneResult<Vec<Instance>>;

    /// Retrieve a record by id
    async fn find_one(&self, id: &str) -> ControlPlaneResult<Option<Instance>>;

    /// Atomically replace the record whose stored revision equals
    /// `instance.revision`, returning the stored copy at the next revision.
    async fn update(&self, instance: Instance) -> ControlPlaneResult<Instance>;
}

/// In-memory implementation of the instance repository
#[derive(Clone)]
pub struct InMemoryInstanceRepository {
    storage: Arc<RwLock<HashMap<String, Instance>>>,
}

impl InMemoryInstanceRepository {
    pub fn new() -> Self {
        Self {
            storage: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryInstanceRepository {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: T) -> ControlPlaneError {
    ControlPlaneError::StorageError("Lock poisoned".to_string())
}

#[async_trait]
impl InstanceRepository for InMemoryInstanceRepository {
    async fn create(&self, instance: Instance) -> ControlPlaneResult<()> {
        let mut storage = self.storage.write().map_err(poisoned)?;
        if storage.contains_key(&instance.id) {
            return Err(ControlPlaneError::StorageError(format!(
                "instance {} already exists",
                instance.id
            )));
        }
        storage.insert(instance.id.clone(), instance);
        Ok(())
    }

    async fn find(&self, filter: &InstanceFilter) -> ControlPlaneResult<Vec<Instance>> {
        let storage = self.storage.read().map_err(poisoned)?;
        Ok(storage
            .values()
            .filter(|instance| filter.matches(instance))
            .cloned()
            .collect())
    }

    async fn find_one(&self, id: &str) -> ControlPlaneResult<Option<Instance>> {
        let storage = self.storage.read().map_err(poisoned)?;
        Ok(storage.get(id).cloned())
    }

    async fn update(&self, instance: Instance) -> ControlPlaneResult<Instance> {
        let mut storage = self.storage.write().map_err(poisoned)?;

        let stored = storage
            .get_mut(&instance.id)
            .ok_or_else(|| ControlPlaneError::InstanceNotFound(instance.id.clone()))?;

        if stored.revision != instance.revision {
            return Err(ControlPlaneError::Concurrency {
                instance_id: instance.id,
                expected: instance.revision,
                actual: stored.revision,
            });
        }

        *stored = Instance {
            revision: instance.revision + 1,
            ..instance
        };
        Ok(stored.clone())
    }
}
