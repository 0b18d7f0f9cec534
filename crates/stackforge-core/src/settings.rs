//! Run-wide settings derived from the global configuration section

use crate::config::GlobalConfig;
use serde::{Deserialize, Serialize};

pub const DEFAULT_REGION: &str = "us-east-1";

/// AWS partition a region belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Partition {
    #[serde(rename = "aws")]
    Standard,
    #[serde(rename = "aws-cn")]
    China,
    #[serde(rename = "aws-us-gov")]
    GovCloud,
}

impl Partition {
    pub fn from_region(region: &str) -> Self {
        if region.starts_with("cn-") {
            Partition::China
        } else if region.starts_with("us-gov-") {
            Partition::GovCloud
        } else {
            Partition::Standard
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Partition::Standard => "aws",
            Partition::China => "aws-cn",
            Partition::GovCloud => "aws-us-gov",
        }
    }

    /// ARN of an AWS managed policy in this partition
    pub fn managed_policy_arn(&self, policy: &str) -> String {
        format!("arn:{}:iam::aws:policy/{}", self.as_str(), policy)
    }

    /// Service principal for EC2 in this partition
    pub fn ec2_principal(&self) -> &'static str {
        match self {
            Partition::China => "ec2.amazonaws.com.cn",
            _ => "ec2.amazonaws.com",
        }
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pick the first configured region: explicit, `AWS_REGION`, `AWS_DEFAULT_REGION`.
pub fn resolve_region(
    configured: Option<&str>,
    aws_region: Option<&str>,
    aws_default_region: Option<&str>,
) -> String {
    [configured, aws_region, aws_default_region]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|region| !region.is_empty())
        .unwrap_or(DEFAULT_REGION)
        .to_string()
}

/// Settings shared by every forge in one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSettings {
    pub stack_name: String,
    pub description: String,
    pub region: String,
    pub partition: Partition,
    pub dual_stack: bool,
}

impl RunSettings {
    pub fn new(stack_name: impl Into<String>, region: impl Into<String>) -> Self {
        let region = region.into();
        Self {
            stack_name: stack_name.into(),
            description: String::new(),
            partition: Partition::from_region(&region),
            region,
            dual_stack: false,
        }
    }

    /// Build settings from the global section, consulting the environment for the region
    pub fn from_global(global: &GlobalConfig) -> Self {
        let aws_region = std::env::var("AWS_REGION").ok();
        let aws_default_region = std::env::var("AWS_DEFAULT_REGION").ok();
        let region = resolve_region(
            global.region.as_deref(),
            aws_region.as_deref(),
            aws_default_region.as_deref(),
        );
        tracing::debug!("Resolved region {} for stack {}", region, global.stack_name);

        Self {
            description: global.description.clone(),
            dual_stack: global.dual_stack,
            ..Self::new(global.stack_name.clone(), region)
        }
    }

    pub fn with_dual_stack(mut self, dual_stack: bool) -> Self {
        self.dual_stack = dual_stack;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_from_region() {
        assert_eq!(Partition::from_region("us-east-1"), Partition::Standard);
        assert_eq!(Partition::from_region("cn-north-1"), Partition::China);
        assert_eq!(Partition::from_region("us-gov-west-1"), Partition::GovCloud);
    }

    #[test]
    fn test_managed_policy_arn() {
        assert_eq!(
            Partition::China.managed_policy_arn("AmazonSSMManagedInstanceCore"),
            "arn:aws-cn:iam::aws:policy/AmazonSSMManagedInstanceCore"
        );
    }

    #[test]
    fn test_resolve_region_order() {
        assert_eq!(
            resolve_region(Some("eu-west-1"), Some("ap-east-1"), None),
            "eu-west-1"
        );
        assert_eq!(resolve_region(None, Some("ap-east-1"), Some("x")), "ap-east-1");
        assert_eq!(resolve_region(None, Some(" "), Some("sa-east-1")), "sa-east-1");
        assert_eq!(resolve_region(None, None, None), DEFAULT_REGION);
    }

    #[test]
    fn test_settings_from_explicit_region() {
        let global = GlobalConfig {
            stack_name: "demo".into(),
            description: "demo stack".into(),
            dual_stack: true,
            region: Some("cn-northwest-1".into()),
        };
        let settings = RunSettings::from_global(&global);
        assert_eq!(settings.region, "cn-northwest-1");
        assert_eq!(settings.partition, Partition::China);
        assert!(settings.dual_stack);
        assert_eq!(settings.description, "demo stack");
    }
}
