use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ProviderResult;

/// A resource tag. A tag without a value matches every value of its key
/// when used for deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: Option<String>,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn key_only(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }
}

/// Describe filter in the provider's `Name`/`Values` form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub name: String,
    pub values: Vec<String>,
}

impl Filter {
    pub fn new(name: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    pub fn tag(key: &str, value: impl Into<String>) -> Self {
        Self::new(format!("tag:{key}"), vec![value.into()])
    }

    pub fn tag_key(key: impl Into<String>) -> Self {
        Self::new("tag-key", vec![key.into()])
    }

    pub fn tag_value(value: impl Into<String>) -> Self {
        Self::new("tag-value", vec![value.into()])
    }

    pub fn instance_state(states: &[ProviderInstanceState]) -> Self {
        Self::new(
            "instance-state-name",
            states.iter().map(|s| s.as_str().to_string()).collect(),
        )
    }

    pub fn instance_type(instance_type: impl Into<String>) -> Self {
        Self::new("instance-type", vec![instance_type.into()])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderInstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
}

impl ProviderInstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderInstanceState::Pending => "pending",
            ProviderInstanceState::Running => "running",
            ProviderInstanceState::ShuttingDown => "shutting-down",
            ProviderInstanceState::Terminated => "terminated",
            ProviderInstanceState::Stopping => "stopping",
            ProviderInstanceState::Stopped => "stopped",
        }
    }
}

/// Provider-side view of one compute instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInstance {
    pub instance_id: String,
    pub image_id: String,
    pub instance_type: String,
    pub state: ProviderInstanceState,
    pub public_ip_address: Option<String>,
    pub security_groups: Vec<String>,
    pub tags: Vec<Tag>,
    pub launch_time: DateTime<Utc>,
}

impl ProviderInstance {
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.key == key)
            .and_then(|tag| tag.value.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub instances: Vec<ProviderInstance>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInstancesRequest {
    pub image_id: String,
    pub instance_type: String,
    pub min_count: u32,
    pub max_count: u32,
    pub security_groups: Vec<String>,
    pub key_name: Option<String>,
    pub tags: Vec<Tag>,
}

impl RunInstancesRequest {
    /// Request for exactly one instance.
    pub fn single(image_id: impl Into<String>, instance_type: impl Into<String>) -> Self {
        Self {
            image_id: image_id.into(),
            instance_type: instance_type.into(),
            min_count: 1,
            max_count: 1,
            security_groups: Vec::new(),
            key_name: None,
            tags: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescribeInstancesRequest {
    pub instance_ids: Vec<String>,
    pub filters: Vec<Filter>,
}

impl DescribeInstancesRequest {
    pub fn by_ids(instance_ids: Vec<String>) -> Self {
        Self {
            instance_ids,
            filters: Vec::new(),
        }
    }

    pub fn by_filters(filters: Vec<Filter>) -> Self {
        Self {
            instance_ids: Vec::new(),
            filters,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStateChange {
    pub instance_id: String,
    pub previous_state: ProviderInstanceState,
    pub current_state: ProviderInstanceState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpPermission {
    pub ip_protocol: String,
    pub from_port: u16,
    pub to_port: u16,
    pub ip_ranges: Vec<String>,
}

impl IpPermission {
    /// tcp/22 open to every address.
    pub fn ssh_from_anywhere() -> Self {
        Self {
            ip_protocol: "tcp".to_string(),
            from_port: 22,
            to_port: 22,
            ip_ranges: vec!["0.0.0.0/0".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub group_id: String,
    pub group_name: String,
    pub ip_permissions: Vec<IpPermission>,
}

/// Named target states understood by the provider's waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WaitTarget {
    InstanceRunning,
    InstanceStopped,
    InstanceTerminated,
}

impl WaitTarget {
    pub fn waiter_name(&self) -> &'static str {
        match self {
            WaitTarget::InstanceRunning => "instanceRunning",
            WaitTarget::InstanceStopped => "instanceStopped",
            WaitTarget::InstanceTerminated => "instanceTerminated",
        }
    }

    pub fn target_state(&self) -> ProviderInstanceState {
        match self {
            WaitTarget::InstanceRunning => ProviderInstanceState::Running,
            WaitTarget::InstanceStopped => ProviderInstanceState::Stopped,
            WaitTarget::InstanceTerminated => ProviderInstanceState::Terminated,
        }
    }
}

/// Compute provider API surface the pool depends on.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    async fn run_instances(&self, request: RunInstancesRequest) -> ProviderResult<Reservation>;

    async fn describe_instances(
        &self,
        request: DescribeInstancesRequest,
    ) -> ProviderResult<Vec<Reservation>>;

    async fn terminate_instances(
        &self,
        instance_ids: &[String],
    ) -> ProviderResult<Vec<InstanceStateChange>>;

    async fn start_instances(
        &self,
        instance_ids: &[String],
    ) -> ProviderResult<Vec<InstanceStateChange>>;

    async fn stop_instances(
        &self,
        instance_ids: &[String],
    ) -> ProviderResult<Vec<InstanceStateChange>>;

    /// Returns the id of the new group.
    async fn create_security_group(
        &self,
        group_name: &str,
        description: &str,
    ) -> ProviderResult<String>;

    async fn describe_security_groups(
        &self,
        group_names: &[String],
    ) -> ProviderResult<Vec<SecurityGroup>>;

    async fn authorize_security_group_ingress(
        &self,
        group_id: &str,
        group_name: &str,
        permissions: Vec<IpPermission>,
    ) -> ProviderResult<()>;

    async fn create_tags(&self, resource_ids: &[String], tags: &[Tag]) -> ProviderResult<()>;

    async fn delete_tags(&self, resource_ids: &[String], tags: &[Tag]) -> ProviderResult<()>;

    /// Blocks until every instance matching `filters` reaches `target`, or
    /// fails with [`crate::ProviderError::Timeout`] once `timeout` elapses.
    async fn wait_for(
        &self,
        target: WaitTarget,
        filters: &[Filter],
        timeout: Duration,
    ) -> ProviderResult<Vec<Reservation>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_filter_name() {
        let filter = Filter::tag("ID", "da14fbf2");
        assert_eq!(filter.name, "tag:ID");
        assert_eq!(filter.values, vec!["da14fbf2".to_string()]);
    }

    #[test]
    fn test_state_filter_uses_provider_names() {
        let filter = Filter::instance_state(&[
            ProviderInstanceState::Running,
            ProviderInstanceState::Pending,
        ]);
        assert_eq!(filter.name, "instance-state-name");
        assert_eq!(filter.values, vec!["running", "pending"]);
    }

    #[test]
    fn test_ssh_rule_shape() {
        let rule = IpPermission::ssh_from_anywhere();
        assert_eq!(rule.ip_protocol, "tcp");
        assert_eq!((rule.from_port, rule.to_port), (22, 22));
        assert_eq!(rule.ip_ranges, vec!["0.0.0.0/0"]);
    }

    #[test]
    fn test_waiter_names() {
        assert_eq!(WaitTarget::InstanceRunning.waiter_name(), "instanceRunning");
        assert_eq!(WaitTarget::InstanceStopped.waiter_name(), "instanceStopped");
        assert_eq!(
            WaitTarget::InstanceTerminated.target_state(),
            ProviderInstanceState::Terminated
        );
    }
}
