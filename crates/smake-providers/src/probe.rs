use async_trait::async_trait;
use thiserror::Error;

/// Port the readiness probe connects to by default (operator ssh access).
pub const DEFAULT_PROBE_PORT: u16 = 22;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub provider_id: String,
    pub port: u16,
}

impl ProbeTarget {
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            port: DEFAULT_PROBE_PORT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("Instance {provider_id} unreachable: {reason}")]
    Unreachable { provider_id: String, reason: String },
}

/// Decides whether a freshly booted instance is usable.
///
/// Implementations own any retrying; callers invoke this exactly once per
/// readiness attempt.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn wait_until_reachable(&self, target: &ProbeTarget) -> Result<(), ProbeError>;
}
