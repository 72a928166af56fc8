use smake_core::CoreError;
use smake_providers::ProviderError;
use thiserror::Error;

/// Control plane specific errors
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error(
        "Optimistic concurrency conflict on instance {instance_id}: \
         update carried revision {expected} but stored revision is {actual}"
    )]
    Concurrency {
        instance_id: String,
        expected: u64,
        actual: u64,
    },
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),
    #[error(transparent)]
    Provider(ProviderError),
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("Storage error: {0}")]
    StorageError(String),
    #[error("Pool exhausted: no pooled instance of type {0}")]
    PoolExhausted(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ControlPlaneError {
    pub fn is_concurrency(&self) -> bool {
        matches!(self, ControlPlaneError::Concurrency { .. })
    }

    /// The provider error code, when this error came from the provider API.
    pub fn provider_code(&self) -> Option<&str> {
        match self {
            ControlPlaneError::Provider(err) => err.code(),
            _ => None,
        }
    }
}

impl From<CoreError> for ControlPlaneError {
    fn from(err: CoreError) -> Self {
        ControlPlaneError::ValidationError(err.to_string())
    }
}

impl From<ProviderError> for ControlPlaneError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Timeout(message) => ControlPlaneError::Timeout(message),
            other => ControlPlaneError::Provider(other),
        }
    }
}

pub type ControlPlaneResult<T> = std::result::Result<T, ControlPlaneError>;
