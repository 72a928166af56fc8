pub mod compute;
pub mod probe;
pub mod simulated;

pub use compute::{
    ComputeProvider, DescribeInstancesRequest, Filter, InstanceStateChange, IpPermission,
    ProviderInstance, ProviderInstanceState, Reservation, RunInstancesRequest, SecurityGroup, Tag,
    WaitTarget,
};
pub use probe::{ProbeError, ProbeTarget, ReachabilityProbe};
pub use simulated::SimulatedCloud;

use thiserror::Error;

/// Error codes reported by the compute provider API.
pub mod codes {
    pub const INVALID_AMI_MALFORMED: &str = "InvalidAMIID.Malformed";
    pub const INVALID_PARAMETER_VALUE: &str = "InvalidParameterValue";
    pub const INVALID_GROUP_RESERVED: &str = "InvalidGroup.Reserved";
    pub const INVALID_GROUP_NOT_FOUND: &str = "InvalidGroup.NotFound";
    pub const INVALID_GROUP_DUPLICATE: &str = "InvalidGroup.Duplicate";
    pub const INVALID_INSTANCE_NOT_FOUND: &str = "InvalidInstanceID.NotFound";
    pub const INTERNAL_ERROR: &str = "InternalError";
}

/// Failures surfaced by a compute provider.
///
/// Callers pass these through unchanged, so the provider's code and message
/// reach the original requester intact.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("{code}: {message}")]
    Api { code: String, message: String },
    #[error("{0}")]
    Timeout(String),
    #[error("Malformed provider response: {0}")]
    MalformedResponse(String),
}

impl ProviderError {
    pub fn api(code: impl Into<String>, message: impl Into<String>) -> Self {
        ProviderError::Api {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn instance_not_found(what: impl AsRef<str>) -> Self {
        Self::api(
            codes::INVALID_INSTANCE_NOT_FOUND,
            format!("The instance ID '{}' does not exist", what.as_ref()),
        )
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            ProviderError::Api { code, .. } => Some(code),
            _ => None,
        }
    }

    pub fn is_code(&self, code: &str) -> bool {
        self.code() == Some(code)
    }
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;
