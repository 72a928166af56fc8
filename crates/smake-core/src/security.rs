use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Group used when the caller names neither a new nor an existing group.
pub const DEFAULT_SECURITY_GROUP: &str = "service-maker";

/// Caller supplied security group options for a new instance.
///
/// At most one of the two fields may be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityOptions {
    pub create_security_group: Option<String>,
    pub existing_security_group: Option<String>,
}

impl SecurityOptions {
    pub fn create(name: impl Into<String>) -> Self {
        Self {
            create_security_group: Some(name.into()),
            existing_security_group: None,
        }
    }

    pub fn existing(name: impl Into<String>) -> Self {
        Self {
            create_security_group: None,
            existing_security_group: Some(name.into()),
        }
    }

    pub fn choice(&self) -> Result<SecurityGroupChoice, CoreError> {
        match (&self.create_security_group, &self.existing_security_group) {
            (Some(_), Some(_)) => Err(CoreError::InvalidSecurityOptions(
                "both create_security_group and existing_security_group were specified"
                    .to_string(),
            )),
            (Some(name), None) => Ok(SecurityGroupChoice::Create(name.clone())),
            (None, Some(name)) => Ok(SecurityGroupChoice::Existing(name.clone())),
            (None, None) => Ok(SecurityGroupChoice::Default),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityGroupChoice {
    Create(String),
    Existing(String),
    Default,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_choice_for_each_option() {
        assert_eq!(
            SecurityOptions::create("created-group").choice().unwrap(),
            SecurityGroupChoice::Create("created-group".to_string())
        );
        assert_eq!(
            SecurityOptions::existing("existing-group").choice().unwrap(),
            SecurityGroupChoice::Existing("existing-group".to_string())
        );
        assert_eq!(
            SecurityOptions::default().choice().unwrap(),
            SecurityGroupChoice::Default
        );
    }

    #[test]
    fn test_both_options_rejected_naming_both_fields() {
        let options = SecurityOptions {
            create_security_group: Some("g1".to_string()),
            existing_security_group: Some("g2".to_string()),
        };

        let message = options.choice().unwrap_err().to_string();
        assert!(message.contains("create_security_group"));
        assert!(message.contains("existing_security_group"));
    }
}
