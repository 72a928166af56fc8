use std::collections::BTreeMap;
use std::time::Duration;

use smake_core::{
    InstanceSpec, PoolRequirement, DEFAULT_AMI, DEFAULT_INSTANCE_TYPE, DEFAULT_SECURITY_GROUP,
};
use smake_providers::{Filter, Tag};

use crate::shared::error::{ControlPlaneError, ControlPlaneResult};

pub const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_POOL_SHAPE: &str = "t2.micro=1";
pub const DEFAULT_TAG_ATTEMPTS: u32 = 3;

/// Resource tags linking provider instances to this system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagConventions {
    pub domain_id_key: String,
    pub pool_key: String,
    pub pool_value: String,
}

impl Default for TagConventions {
    fn default() -> Self {
        Self {
            domain_id_key: "ID".to_string(),
            pool_key: "smake".to_string(),
            pool_value: "pool".to_string(),
        }
    }
}

impl TagConventions {
    pub fn domain_id_tag(&self, domain_id: &str) -> Tag {
        Tag::new(self.domain_id_key.clone(), domain_id)
    }

    pub fn domain_id_filter(&self, domain_id: &str) -> Filter {
        Filter::tag(&self.domain_id_key, domain_id)
    }

    pub fn pool_tag(&self) -> Tag {
        Tag::new(self.pool_key.clone(), self.pool_value.clone())
    }

    /// Key-only form, removes the pool tag whatever its value.
    pub fn pool_tag_key(&self) -> Tag {
        Tag::key_only(self.pool_key.clone())
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub default_security_group: String,
    pub key_name: Option<String>,
    pub wait_timeout: Duration,
    pub tags: TagConventions,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            default_security_group: DEFAULT_SECURITY_GROUP.to_string(),
            key_name: None,
            wait_timeout: Duration::from_secs(DEFAULT_WAIT_TIMEOUT_SECS),
            tags: TagConventions::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub tags: TagConventions,
    pub tag_attempts: u32,
    pub default_ami: String,
    pub image_catalog: BTreeMap<String, String>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            tags: TagConventions::default(),
            tag_attempts: DEFAULT_TAG_ATTEMPTS,
            default_ami: DEFAULT_AMI.to_string(),
            image_catalog: BTreeMap::new(),
        }
    }
}

impl PoolSettings {
    /// Catalog image for `instance_type`, or the default image.
    pub fn image_for(&self, instance_type: &str) -> &str {
        self.image_catalog
            .get(instance_type)
            .map(String::as_str)
            .unwrap_or(&self.default_ami)
    }
}

/// Process configuration, read from `SMAKE_*` environment variables.
#[derive(Debug, Clone)]
pub struct SmakeConfig {
    pub default_ami: String,
    pub default_type: String,
    pub security_group: String,
    pub key_name: Option<String>,
    pub wait_timeout: Duration,
    pub pool_shape: Vec<PoolRequirement>,
    pub image_catalog: BTreeMap<String, String>,
}

impl Default for SmakeConfig {
    fn default() -> Self {
        Self {
            default_ami: DEFAULT_AMI.to_string(),
            default_type: DEFAULT_INSTANCE_TYPE.to_string(),
            security_group: DEFAULT_SECURITY_GROUP.to_string(),
            key_name: None,
            wait_timeout: Duration::from_secs(DEFAULT_WAIT_TIMEOUT_SECS),
            pool_shape: vec![PoolRequirement::new(DEFAULT_INSTANCE_TYPE, 1)],
            image_catalog: BTreeMap::new(),
        }
    }
}

impl SmakeConfig {
    pub fn from_env() -> ControlPlaneResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ControlPlaneResult<Self> {
        let non_empty = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let wait_timeout = match non_empty("SMAKE_WAIT_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(raw.parse::<u64>().map_err(|e| {
                ControlPlaneError::ValidationError(format!(
                    "SMAKE_WAIT_TIMEOUT_SECS must be a whole number of seconds: {e}"
                ))
            })?),
            None => Duration::from_secs(DEFAULT_WAIT_TIMEOUT_SECS),
        };

        let pool_shape = parse_pool_shape(
            non_empty("SMAKE_POOL_SHAPE")
                .as_deref()
                .unwrap_or(DEFAULT_POOL_SHAPE),
        )?;

        let image_catalog = match non_empty("SMAKE_IMAGE_CATALOG") {
            Some(raw) => parse_image_catalog(&raw)?,
            None => BTreeMap::new(),
        };

        Ok(Self {
            default_ami: non_empty("SMAKE_DEFAULT_AMI").unwrap_or_else(|| DEFAULT_AMI.to_string()),
            default_type: non_empty("SMAKE_DEFAULT_TYPE")
                .unwrap_or_else(|| DEFAULT_INSTANCE_TYPE.to_string()),
            security_group: non_empty("SMAKE_SECURITY_GROUP")
                .unwrap_or_else(|| DEFAULT_SECURITY_GROUP.to_string()),
            key_name: non_empty("SMAKE_KEY_NAME"),
            wait_timeout,
            pool_shape,
            image_catalog,
        })
    }

    pub fn instance_defaults(&self) -> InstanceSpec {
        InstanceSpec::new(self.default_ami.clone(), self.default_type.clone())
    }

    pub fn lifecycle_settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            default_security_group: self.security_group.clone(),
            key_name: self.key_name.clone(),
            wait_timeout: self.wait_timeout,
            tags: TagConventions::default(),
        }
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            default_ami: self.default_ami.clone(),
            image_catalog: self.image_catalog.clone(),
            ..PoolSettings::default()
        }
    }
}

fn split_pairs(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn split_pair<'a>(entry: &'a str, what: &str) -> ControlPlaneResult<(&'a str, &'a str)> {
    match entry.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() && !value.trim().is_empty() => {
            Ok((key.trim(), value.trim()))
        }
        _ => Err(ControlPlaneError::ValidationError(format!(
            "invalid {what} entry '{entry}', expected key=value"
        ))),
    }
}

/// Parses `type=count,...`. A type listed twice keeps its last count.
pub fn parse_pool_shape(raw: &str) -> ControlPlaneResult<Vec<PoolRequirement>> {
    let mut shape: Vec<PoolRequirement> = Vec::new();
    for entry in split_pairs(raw) {
        let (instance_type, count) = split_pair(entry, "pool shape")?;
        let count = count.parse::<u32>().map_err(|e| {
            ControlPlaneError::ValidationError(format!(
                "invalid pool count for {instance_type}: {e}"
            ))
        })?;

        match shape.iter_mut().find(|r| r.instance_type == instance_type) {
            Some(existing) => existing.count = count,
            None => shape.push(PoolRequirement::new(instance_type, count)),
        }
    }
    Ok(shape)
}

/// Parses `type=ami,...`.
pub fn parse_image_catalog(raw: &str) -> ControlPlaneResult<BTreeMap<String, String>> {
    split_pairs(raw)
        .map(|entry| {
            split_pair(entry, "image catalog")
                .map(|(ty, ami)| (ty.to_string(), ami.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_nothing_is_set() {
        let config = SmakeConfig::from_lookup(lookup_from(&[])).unwrap();

        assert_eq!(config.default_ami, "ami-d05e75b8");
        assert_eq!(config.default_type, "t2.micro");
        assert_eq!(config.security_group, "service-maker");
        assert_eq!(config.wait_timeout, Duration::from_secs(300));
        assert_eq!(config.pool_shape, vec![PoolRequirement::new("t2.micro", 1)]);
        assert!(config.key_name.is_none());
    }

    #[test]
    fn test_values_are_read_from_lookup() {
        let config = SmakeConfig::from_lookup(lookup_from(&[
            ("SMAKE_DEFAULT_TYPE", "t2.small"),
            ("SMAKE_KEY_NAME", "ops"),
            ("SMAKE_WAIT_TIMEOUT_SECS", "12"),
            ("SMAKE_POOL_SHAPE", "t2.micro=3, t2.large=1"),
            ("SMAKE_IMAGE_CATALOG", "t2.large=ami-0000beef"),
        ]))
        .unwrap();

        assert_eq!(config.default_type, "t2.small");
        assert_eq!(config.key_name.as_deref(), Some("ops"));
        assert_eq!(config.wait_timeout, Duration::from_secs(12));
        assert_eq!(
            config.pool_shape,
            vec![
                PoolRequirement::new("t2.micro", 3),
                PoolRequirement::new("t2.large", 1)
            ]
        );

        let pool = config.pool_settings();
        assert_eq!(pool.image_for("t2.large"), "ami-0000beef");
        assert_eq!(pool.image_for("t2.micro"), "ami-d05e75b8");
    }

    #[test]
    fn test_bad_timeout_is_validation_error() {
        let err = SmakeConfig::from_lookup(lookup_from(&[("SMAKE_WAIT_TIMEOUT_SECS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ControlPlaneError::ValidationError(_)));
    }

    #[test]
    fn test_pool_shape_rejects_malformed_entries() {
        assert!(parse_pool_shape("t2.micro").is_err());
        assert!(parse_pool_shape("t2.micro=-1").is_err());
        assert!(parse_pool_shape("=2").is_err());
        assert!(parse_pool_shape("").unwrap().is_empty());
    }

    #[test]
    fn test_pool_shape_last_count_wins() {
        let shape = parse_pool_shape("t2.micro=1,t2.micro=4").unwrap();
        assert_eq!(shape, vec![PoolRequirement::new("t2.micro", 4)]);
    }

    #[test]
    fn test_tag_conventions() {
        let tags = TagConventions::default();
        assert_eq!(tags.domain_id_filter("abc").name, "tag:ID");
        assert_eq!(tags.pool_tag(), Tag::new("smake", "pool"));
        assert_eq!(tags.pool_tag_key().value, None);
    }
}
