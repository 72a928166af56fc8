use crate::config::TagConventions;
use smake_providers::{
    ComputeProvider, DescribeInstancesRequest, Filter, ProviderError, ProviderInstance,
    ProviderResult,
};
use std::sync::Arc;
use tracing::debug;

/// Provider access keyed by domain id.
///
/// Domain ids are never stored provider-side except as the `ID` resource
/// tag, so every lookup goes through a tag-filtered describe.
#[derive(Clone)]
pub struct ProviderGateway {
    provider: Arc<dyn ComputeProvider>,
    tags: TagConventions,
}

impl ProviderGateway {
    pub fn new(provider: Arc<dyn ComputeProvider>, tags: TagConventions) -> Self {
        Self { provider, tags }
    }

    pub fn provider(&self) -> &dyn ComputeProvider {
        self.provider.as_ref()
    }

    pub fn tags(&self) -> &TagConventions {
        &self.tags
    }

    pub fn domain_filters(&self, domain_id: &str) -> Vec<Filter> {
        vec![self.tags.domain_id_filter(domain_id)]
    }

    pub async fn find_by_domain_id(&self, domain_id: &str) -> ProviderResult<Vec<ProviderInstance>> {
        let reservations = self
            .provider
            .describe_instances(DescribeInstancesRequest::by_filters(
                self.domain_filters(domain_id),
            ))
            .await?;
        Ok(reservations
            .into_iter()
            .flat_map(|reservation| reservation.instances)
            .collect())
    }

    pub async fn resolve_provider_id(&self, domain_id: &str) -> ProviderResult<String> {
        let provider_id = self
            .find_by_domain_id(domain_id)
            .await?
            .into_iter()
            .next()
            .map(|instance| instance.instance_id)
            .ok_or_else(|| {
                ProviderError::instance_not_found(format!(
                    "tag:{}={}",
                    self.tags.domain_id_key, domain_id
                ))
            })?;

        debug!(instance_id = %domain_id, provider_id = %provider_id, "Resolved provider id");
        Ok(provider_id)
    }

    pub async fn describe(&self, provider_id: &str) -> ProviderResult<Vec<ProviderInstance>> {
        let reservations = self
            .provider
            .describe_instances(DescribeInstancesRequest::by_ids(vec![
                provider_id.to_string()
            ]))
            .await?;
        Ok(reservations
            .into_iter()
            .flat_map(|reservation| reservation.instances)
            .collect())
    }

    /// The `ID` tag of `provider_id`, if it carries one.
    pub async fn domain_id_of(&self, provider_id: &str) -> ProviderResult<Option<String>> {
        Ok(self.describe(provider_id).await?.into_iter().find_map(|instance| {
            instance
                .tag_value(&self.tags.domain_id_key)
                .map(str::to_string)
        }))
    }

    /// Public address of the first instance the provider reports for `provider_id`.
    pub async fn public_ip_address(&self, provider_id: &str) -> ProviderResult<String> {
        self.describe(provider_id)
            .await?
            .into_iter()
            .next()
            .and_then(|instance| instance.public_ip_address)
            .ok_or_else(|| {
                ProviderError::MalformedResponse(format!(
                    "instance {provider_id} has no public address"
                ))
            })
    }
}
