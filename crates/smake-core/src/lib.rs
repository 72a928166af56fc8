pub mod security;
pub mod state;

pub use security::{SecurityGroupChoice, SecurityOptions, DEFAULT_SECURITY_GROUP};
pub use state::InstanceState;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_AMI: &str = "ami-d05e75b8";
pub const DEFAULT_INSTANCE_TYPE: &str = "t2.micro";

#[derive(Debug, Clone, Error)]
pub enum CoreError {
    #[error("Invalid instance state: {0}")]
    InvalidState(String),
    #[error("Invalid security options: {0}")]
    InvalidSecurityOptions(String),
    #[error("Invalid instance record: {0}")]
    InvalidInstance(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// A managed compute instance as tracked by the instance store.
///
/// The `revision` guards optimistic concurrency: every accepted update bumps
/// it by exactly one, and updates carrying an older revision are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub ami: String,
    #[serde(rename = "type")]
    pub instance_type: String,
    pub state: InstanceState,
    pub uri: Option<String>,
    pub revision: u64,
}

impl Instance {
    pub fn new(ami: impl Into<String>, instance_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            ami: ami.into(),
            instance_type: instance_type.into(),
            state: InstanceState::Pending,
            uri: None,
            revision: 1,
        }
    }

    /// Copy of this record carrying a new state and uri at the same revision,
    /// ready to be handed to the store as an update.
    pub fn with_state(&self, state: InstanceState, uri: Option<String>) -> Self {
        Self {
            state,
            uri,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.revision == 0 {
            return Err(CoreError::InvalidInstance(format!(
                "instance {} has revision 0",
                self.id
            )));
        }

        if self.uri.is_some() && !self.state.allows_uri() {
            return Err(CoreError::InvalidInstance(format!(
                "instance {} may not carry a uri while {}",
                self.id, self.state
            )));
        }

        Ok(())
    }
}

/// Equality filter over instance records. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceFilter {
    pub ami: Option<String>,
    #[serde(rename = "type")]
    pub instance_type: Option<String>,
}

impl InstanceFilter {
    pub fn by_ami(ami: impl Into<String>) -> Self {
        Self {
            ami: Some(ami.into()),
            instance_type: None,
        }
    }

    pub fn by_type(instance_type: impl Into<String>) -> Self {
        Self {
            ami: None,
            instance_type: Some(instance_type.into()),
        }
    }

    pub fn matches(&self, instance: &Instance) -> bool {
        self.ami.as_deref().map_or(true, |ami| ami == instance.ami)
            && self
                .instance_type
                .as_deref()
                .map_or(true, |ty| ty == instance.instance_type)
    }
}

/// Image and shape requested for a new instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub ami: String,
    #[serde(rename = "type")]
    pub instance_type: String,
}

impl InstanceSpec {
    pub fn new(ami: impl Into<String>, instance_type: impl Into<String>) -> Self {
        Self {
            ami: ami.into(),
            instance_type: instance_type.into(),
        }
    }
}

impl Default for InstanceSpec {
    fn default() -> Self {
        Self::new(DEFAULT_AMI, DEFAULT_INSTANCE_TYPE)
    }
}

/// How many instances of one type the pool should hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRequirement {
    #[serde(rename = "type")]
    pub instance_type: String,
    pub count: u32,
}

impl PoolRequirement {
    pub fn new(instance_type: impl Into<String>, count: u32) -> Self {
        Self {
            instance_type: instance_type.into(),
            count,
        }
    }
}
