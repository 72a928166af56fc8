use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::time::{self, Instant};
use tracing::debug;

use crate::compute::{
    ComputeProvider, DescribeInstancesRequest, Filter, InstanceStateChange, IpPermission,
    ProviderInstance, ProviderInstanceState, Reservation, RunInstancesRequest, SecurityGroup, Tag,
    WaitTarget,
};
use crate::probe::{ProbeError, ProbeTarget, ReachabilityProbe};
use crate::{codes, ProviderError, ProviderResult};

const WAITER_POLL_INTERVAL: Duration = Duration::from_millis(10);
const RESERVED_GROUP_NAMES: &[&str] = &["default"];

/// One recorded call against the simulated cloud, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    RunInstances(RunInstancesRequest),
    DescribeInstances(DescribeInstancesRequest),
    TerminateInstances(Vec<String>),
    StartInstances(Vec<String>),
    StopInstances(Vec<String>),
    CreateSecurityGroup {
        group_name: String,
        description: String,
    },
    DescribeSecurityGroups(Vec<String>),
    AuthorizeSecurityGroupIngress {
        group_id: String,
        group_name: String,
        permissions: Vec<IpPermission>,
    },
    CreateTags {
        resource_ids: Vec<String>,
        tags: Vec<Tag>,
    },
    DeleteTags {
        resource_ids: Vec<String>,
        tags: Vec<Tag>,
    },
    WaitFor {
        target: WaitTarget,
        filters: Vec<Filter>,
    },
    Probe(String),
}

#[derive(Debug, Default)]
struct Faults {
    tag_failures_remaining: u32,
    tags_always_fail: bool,
    rejected_images: HashSet<String>,
    rejected_types: HashSet<String>,
    unreachable: HashSet<String>,
    all_unreachable: bool,
    stalled_waiters: bool,
    group_lookup_error: Option<String>,
}

#[derive(Debug, Default)]
struct CloudState {
    instances: BTreeMap<String, ProviderInstance>,
    groups: BTreeMap<String, SecurityGroup>,
    calls: Vec<ProviderCall>,
    faults: Faults,
    next_instance: u64,
    next_group: u64,
}

impl CloudState {
    fn launch(
        &mut self,
        image_id: &str,
        instance_type: &str,
        state: ProviderInstanceState,
        security_groups: Vec<String>,
        tags: Vec<Tag>,
        launch_time: DateTime<Utc>,
    ) -> ProviderInstance {
        self.next_instance += 1;
        let n = self.next_instance;
        let instance = ProviderInstance {
            instance_id: format!("i-{n:017x}"),
            image_id: image_id.to_string(),
            instance_type: instance_type.to_string(),
            state,
            public_ip_address: Some(format!("203.0.113.{}", n % 254 + 1)),
            security_groups,
            tags,
            launch_time,
        };
        self.instances
            .insert(instance.instance_id.clone(), instance.clone());
        instance
    }
}

/// In-memory compute provider and reachability probe.
///
/// Instances launch `pending`, become `running` once probed, and every
/// start/stop/terminate completes immediately. Faults can be injected to
/// reproduce provider failures. Clones share the same cloud.
#[derive(Clone, Default)]
pub struct SimulatedCloud {
    state: Arc<RwLock<CloudState>>,
}

impl SimulatedCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn calls(&self) -> Vec<ProviderCall> {
        self.state.read().await.calls.clone()
    }

    pub async fn instance(&self, instance_id: &str) -> Option<ProviderInstance> {
        self.state.read().await.instances.get(instance_id).cloned()
    }

    pub async fn instances(&self) -> Vec<ProviderInstance> {
        self.state.read().await.instances.values().cloned().collect()
    }

    pub async fn security_group(&self, group_name: &str) -> Option<SecurityGroup> {
        self.state.read().await.groups.get(group_name).cloned()
    }

    pub async fn seed_instance(
        &self,
        instance_type: &str,
        state: ProviderInstanceState,
        tags: Vec<Tag>,
    ) -> String {
        self.seed_instance_launched_at(instance_type, state, tags, Utc::now())
            .await
    }

    pub async fn seed_instance_launched_at(
        &self,
        instance_type: &str,
        state: ProviderInstanceState,
        tags: Vec<Tag>,
        launch_time: DateTime<Utc>,
    ) -> String {
        let mut cloud = self.state.write().await;
        cloud
            .launch(
                "ami-d05e75b8",
                instance_type,
                state,
                Vec::new(),
                tags,
                launch_time,
            )
            .instance_id
    }

    pub async fn seed_security_group(&self, group_name: &str) -> String {
        let mut cloud = self.state.write().await;
        cloud.next_group += 1;
        let group_id = format!("sg-{:08x}", cloud.next_group);
        cloud.groups.insert(
            group_name.to_string(),
            SecurityGroup {
                group_id: group_id.clone(),
                group_name: group_name.to_string(),
                ip_permissions: Vec::new(),
            },
        );
        group_id
    }

    pub async fn set_instance_state(&self, instance_id: &str, state: ProviderInstanceState) {
        if let Some(instance) = self.state.write().await.instances.get_mut(instance_id) {
            instance.state = state;
        }
    }

    pub async fn fail_tagging(&self, attempts: u32) {
        self.state.write().await.faults.tag_failures_remaining = attempts;
    }

    pub async fn fail_tagging_always(&self) {
        self.state.write().await.faults.tags_always_fail = true;
    }

    pub async fn reject_image(&self, image_id: &str) {
        self.state
            .write()
            .await
            .faults
            .rejected_images
            .insert(image_id.to_string());
    }

    pub async fn reject_instance_type(&self, instance_type: &str) {
        self.state
            .write()
            .await
            .faults
            .rejected_types
            .insert(instance_type.to_string());
    }

    pub async fn make_unreachable(&self, instance_id: &str) {
        self.state
            .write()
            .await
            .faults
            .unreachable
            .insert(instance_id.to_string());
    }

    pub async fn make_all_unreachable(&self) {
        self.state.write().await.faults.all_unreachable = true;
    }

    pub async fn stall_waiters(&self) {
        self.state.write().await.faults.stalled_waiters = true;
    }

    pub async fn fail_group_lookups(&self, message: &str) {
        self.state.write().await.faults.group_lookup_error = Some(message.to_string());
    }

    async fn change_state(
        &self,
        call: ProviderCall,
        instance_ids: &[String],
        next: ProviderInstanceState,
    ) -> ProviderResult<Vec<InstanceStateChange>> {
        let mut cloud = self.state.write().await;
        cloud.calls.push(call);

        if let Some(missing) = instance_ids
            .iter()
            .find(|id| !cloud.instances.contains_key(id.as_str()))
        {
            return Err(ProviderError::instance_not_found(missing));
        }

        let mut changes = Vec::with_capacity(instance_ids.len());
        for id in instance_ids {
            if let Some(instance) = cloud.instances.get_mut(id) {
                let previous = instance.state;
                if previous != ProviderInstanceState::Terminated {
                    instance.state = next;
                }
                changes.push(InstanceStateChange {
                    instance_id: id.clone(),
                    previous_state: previous,
                    current_state: instance.state,
                });
            }
        }

        debug!(instances = ?instance_ids, state = next.as_str(), "Simulated state change");
        Ok(changes)
    }
}

fn is_well_formed_image(image_id: &str) -> bool {
    image_id
        .strip_prefix("ami-")
        .map_or(false, |rest| {
            !rest.is_empty() && rest.chars().all(|c| c.is_ascii_hexdigit())
        })
}

fn matches_filter(instance: &ProviderInstance, filter: &Filter) -> ProviderResult<bool> {
    let wanted = |candidate: &str| filter.values.iter().any(|v| v == candidate);

    let matched = match filter.name.as_str() {
        "tag-key" => instance.tags.iter().any(|t| wanted(t.key.as_str())),
        "tag-value" => instance
            .tags
            .iter()
            .filter_map(|t| t.value.as_deref())
            .any(|v| wanted(v)),
        "instance-state-name" => wanted(instance.state.as_str()),
        "instance-type" => wanted(instance.instance_type.as_str()),
        "instance-id" => wanted(instance.instance_id.as_str()),
        name => match name.strip_prefix("tag:") {
            Some(key) => instance.tag_value(key).map_or(false, |v| wanted(v)),
            None => {
                return Err(ProviderError::api(
                    codes::INVALID_PARAMETER_VALUE,
                    format!("The filter '{name}' is invalid"),
                ))
            }
        },
    };

    Ok(matched)
}

fn select(
    cloud: &CloudState,
    request: &DescribeInstancesRequest,
) -> ProviderResult<Vec<ProviderInstance>> {
    if let Some(missing) = request
        .instance_ids
        .iter()
        .find(|id| !cloud.instances.contains_key(id.as_str()))
    {
        return Err(ProviderError::instance_not_found(missing));
    }

    let mut selected = Vec::new();
    'instances: for instance in cloud.instances.values() {
        if !request.instance_ids.is_empty() && !request.instance_ids.contains(&instance.instance_id)
        {
            continue;
        }
        for filter in &request.filters {
            if !matches_filter(instance, filter)? {
                continue 'instances;
            }
        }
        selected.push(instance.clone());
    }

    Ok(selected)
}

fn into_reservations(instances: Vec<ProviderInstance>) -> Vec<Reservation> {
    instances
        .into_iter()
        .map(|instance| Reservation {
            instances: vec![instance],
        })
        .collect()
}

#[async_trait]
impl ComputeProvider for SimulatedCloud {
    async fn run_instances(&self, request: RunInstancesRequest) -> ProviderResult<Reservation> {
        let mut cloud = self.state.write().await;
        cloud.calls.push(ProviderCall::RunInstances(request.clone()));

        if !is_well_formed_image(&request.image_id)
            || cloud.faults.rejected_images.contains(&request.image_id)
        {
            return Err(ProviderError::api(
                codes::INVALID_AMI_MALFORMED,
                "The AMI entered does not exist. Ensure it is of the form ami-xxxxxx.",
            ));
        }

        if cloud.faults.rejected_types.contains(&request.instance_type) {
            return Err(ProviderError::api(
                codes::INVALID_PARAMETER_VALUE,
                "The Type entered does not exist. Ensure it is a valid EC2 type.",
            ));
        }

        if let Some(missing) = request
            .security_groups
            .iter()
            .find(|group| !cloud.groups.contains_key(group.as_str()))
        {
            return Err(ProviderError::api(
                codes::INVALID_GROUP_NOT_FOUND,
                format!("The security group '{missing}' does not exist"),
            ));
        }

        let count = request.max_count.max(request.min_count).max(1);
        let mut instances = Vec::with_capacity(count as usize);
        for _ in 0..count {
            instances.push(cloud.launch(
                &request.image_id,
                &request.instance_type,
                ProviderInstanceState::Pending,
                request.security_groups.clone(),
                request.tags.clone(),
                Utc::now(),
            ));
        }

        debug!(count, image_id = %request.image_id, "Simulated instances launched");
        Ok(Reservation { instances })
    }

    async fn describe_instances(
        &self,
        request: DescribeInstancesRequest,
    ) -> ProviderResult<Vec<Reservation>> {
        let mut cloud = self.state.write().await;
        cloud
            .calls
            .push(ProviderCall::DescribeInstances(request.clone()));
        select(&cloud, &request).map(into_reservations)
    }

    async fn terminate_instances(
        &self,
        instance_ids: &[String],
    ) -> ProviderResult<Vec<InstanceStateChange>> {
        self.change_state(
            ProviderCall::TerminateInstances(instance_ids.to_vec()),
            instance_ids,
            ProviderInstanceState::Terminated,
        )
        .await
    }

    async fn start_instances(
        &self,
        instance_ids: &[String],
    ) -> ProviderResult<Vec<InstanceStateChange>> {
        self.change_state(
            ProviderCall::StartInstances(instance_ids.to_vec()),
            instance_ids,
            ProviderInstanceState::Running,
        )
        .await
    }

    async fn stop_instances(
        &self,
        instance_ids: &[String],
    ) -> ProviderResult<Vec<InstanceStateChange>> {
        self.change_state(
            ProviderCall::StopInstances(instance_ids.to_vec()),
            instance_ids,
            ProviderInstanceState::Stopped,
        )
        .await
    }

    async fn create_security_group(
        &self,
        group_name: &str,
        description: &str,
    ) -> ProviderResult<String> {
        let mut cloud = self.state.write().await;
        cloud.calls.push(ProviderCall::CreateSecurityGroup {
            group_name: group_name.to_string(),
            description: description.to_string(),
        });

        if RESERVED_GROUP_NAMES.contains(&group_name) {
            return Err(ProviderError::api(
                codes::INVALID_GROUP_RESERVED,
                format!("The security group '{group_name}' is reserved"),
            ));
        }
        if cloud.groups.contains_key(group_name) {
            return Err(ProviderError::api(
                codes::INVALID_GROUP_DUPLICATE,
                format!("The security group '{group_name}' already exists"),
            ));
        }

        cloud.next_group += 1;
        let group_id = format!("sg-{:08x}", cloud.next_group);
        cloud.groups.insert(
            group_name.to_string(),
            SecurityGroup {
                group_id: group_id.clone(),
                group_name: group_name.to_string(),
                ip_permissions: Vec::new(),
            },
        );
        Ok(group_id)
    }

    async fn describe_security_groups(
        &self,
        group_names: &[String],
    ) -> ProviderResult<Vec<SecurityGroup>> {
        let mut cloud = self.state.write().await;
        cloud
            .calls
            .push(ProviderCall::DescribeSecurityGroups(group_names.to_vec()));

        if let Some(message) = &cloud.faults.group_lookup_error {
            return Err(ProviderError::api(codes::INTERNAL_ERROR, message.clone()));
        }

        group_names
            .iter()
            .map(|name| {
                cloud.groups.get(name).cloned().ok_or_else(|| {
                    ProviderError::api(
                        codes::INVALID_GROUP_NOT_FOUND,
                        format!("The security group '{name}' does not exist"),
                    )
                })
            })
            .collect()
    }

    async fn authorize_security_group_ingress(
        &self,
        group_id: &str,
        group_name: &str,
        permissions: Vec<IpPermission>,
    ) -> ProviderResult<()> {
        let mut cloud = self.state.write().await;
        cloud.calls.push(ProviderCall::AuthorizeSecurityGroupIngress {
            group_id: group_id.to_string(),
            group_name: group_name.to_string(),
            permissions: permissions.clone(),
        });

        match cloud.groups.get_mut(group_name) {
            Some(group) if group.group_id == group_id => {
                group.ip_permissions.extend(permissions);
                Ok(())
            }
            _ => Err(ProviderError::api(
                codes::INVALID_GROUP_NOT_FOUND,
                format!("The security group '{group_id}' does not exist"),
            )),
        }
    }

    async fn create_tags(&self, resource_ids: &[String], tags: &[Tag]) -> ProviderResult<()> {
        let mut cloud = self.state.write().await;
        cloud.calls.push(ProviderCall::CreateTags {
            resource_ids: resource_ids.to_vec(),
            tags: tags.to_vec(),
        });

        if cloud.faults.tags_always_fail || cloud.faults.tag_failures_remaining > 0 {
            cloud.faults.tag_failures_remaining =
                cloud.faults.tag_failures_remaining.saturating_sub(1);
            return Err(ProviderError::api(
                codes::INTERNAL_ERROR,
                "An internal error has occurred while tagging",
            ));
        }

        if let Some(missing) = resource_ids
            .iter()
            .find(|id| !cloud.instances.contains_key(id.as_str()))
        {
            return Err(ProviderError::instance_not_found(missing));
        }

        for id in resource_ids {
            if let Some(instance) = cloud.instances.get_mut(id) {
                for tag in tags {
                    instance.tags.retain(|existing| existing.key != tag.key);
                    instance.tags.push(tag.clone());
                }
            }
        }
        Ok(())
    }

    async fn delete_tags(&self, resource_ids: &[String], tags: &[Tag]) -> ProviderResult<()> {
        let mut cloud = self.state.write().await;
        cloud.calls.push(ProviderCall::DeleteTags {
            resource_ids: resource_ids.to_vec(),
            tags: tags.to_vec(),
        });

        if let Some(missing) = resource_ids
            .iter()
            .find(|id| !cloud.instances.contains_key(id.as_str()))
        {
            return Err(ProviderError::instance_not_found(missing));
        }

        for id in resource_ids {
            if let Some(instance) = cloud.instances.get_mut(id) {
                instance.tags.retain(|existing| {
                    !tags.iter().any(|tag| {
                        tag.key == existing.key
                            && (tag.value.is_none() || tag.value == existing.value)
                    })
                });
            }
        }
        Ok(())
    }

    async fn wait_for(
        &self,
        target: WaitTarget,
        filters: &[Filter],
        timeout: Duration,
    ) -> ProviderResult<Vec<Reservation>> {
        let request = DescribeInstancesRequest::by_filters(filters.to_vec());
        self.state.write().await.calls.push(ProviderCall::WaitFor {
            target,
            filters: filters.to_vec(),
        });

        let deadline = Instant::now() + timeout;
        loop {
            {
                let cloud = self.state.read().await;
                let matched = select(&cloud, &request)?;
                let settled = !cloud.faults.stalled_waiters
                    && !matched.is_empty()
                    && matched
                        .iter()
                        .all(|instance| instance.state == target.target_state());
                if settled {
                    return Ok(into_reservations(matched));
                }
            }

            if Instant::now() >= deadline {
                return Err(ProviderError::Timeout(format!(
                    "Waiter {} timed out after {:?}",
                    target.waiter_name(),
                    timeout
                )));
            }
            time::sleep(WAITER_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl ReachabilityProbe for SimulatedCloud {
    async fn wait_until_reachable(&self, target: &ProbeTarget) -> Result<(), ProbeError> {
        let mut cloud = self.state.write().await;
        cloud
            .calls
            .push(ProviderCall::Probe(target.provider_id.clone()));

        if cloud.faults.all_unreachable || cloud.faults.unreachable.contains(&target.provider_id)
        {
            return Err(ProbeError::Unreachable {
                provider_id: target.provider_id.clone(),
                reason: format!("connection to port {} refused", target.port),
            });
        }

        match cloud.instances.get_mut(&target.provider_id) {
            Some(instance) if instance.state == ProviderInstanceState::Pending => {
                instance.state = ProviderInstanceState::Running;
                Ok(())
            }
            Some(instance) if instance.state == ProviderInstanceState::Running => Ok(()),
            Some(instance) => Err(ProbeError::Unreachable {
                provider_id: target.provider_id.clone(),
                reason: format!("instance is {}", instance.state.as_str()),
            }),
            None => Err(ProbeError::Unreachable {
                provider_id: target.provider_id.clone(),
                reason: "unknown instance".to_string(),
            }),
        }
    }
}
