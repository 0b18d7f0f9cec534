//! Shared file system forge

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use stackforge_core::merge::{Merge, set_if_present};
use stackforge_core::stack::logical_id;
use stackforge_core::{
    BaseInstanceConfig, Forge, ForgeConfig, ForgeContext, ForgeError, InstanceConfig, PortSpec,
    Properties, PropertySource, Protocol, ResourceRef, Result, merge_typed,
};

pub const NFS_PORT: u16 = 2049;
pub const DEFAULT_REMOVAL_POLICY: &str = "RETAIN";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EfsConfig {
    #[serde(flatten)]
    pub base: BaseInstanceConfig,

    /// `RETAIN`, `DESTROY` or `SNAPSHOT`
    #[serde(default, alias = "removePolicy", skip_serializing_if = "Option::is_none")]
    pub removal_policy: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance_mode: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throughput_mode: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted: Option<bool>,
}

impl Merge for EfsConfig {
    fn merge(&mut self, other: Self) {
        self.base.merge(other.base);
        set_if_present(&mut self.removal_policy, other.removal_policy);
        set_if_present(&mut self.performance_mode, other.performance_mode);
        set_if_present(&mut self.throughput_mode, other.throughput_mode);
        set_if_present(&mut self.encrypted, other.encrypted);
    }
}

impl ForgeConfig for EfsConfig {
    const KIND: &'static str = "efs";

    fn base(&self) -> &BaseInstanceConfig {
        &self.base
    }
}

/// Template deletion policy for a removal policy name
pub fn deletion_policy(removal_policy: &str) -> &'static str {
    match removal_policy.to_ascii_uppercase().as_str() {
        "DESTROY" => "Delete",
        _ => "Retain",
    }
}

#[derive(Debug, Default)]
pub struct EfsForge {
    id: String,
    file_system: Option<ResourceRef>,
    security_group: Option<ResourceRef>,
}

impl EfsForge {
    fn file_system(&self) -> Result<&ResourceRef> {
        self.file_system
            .as_ref()
            .ok_or_else(|| ForgeError::NotCreated(format!("efs {}", self.id)))
    }
}

impl PropertySource for EfsForge {
    fn properties(&self) -> Properties {
        let mut properties = Properties::new();
        if let Some(file_system) = &self.file_system {
            properties.insert("fileSystemId".into(), file_system.to_value());
            properties.insert("fileSystemArn".into(), file_system.attr("Arn"));
            properties.insert("mountPoint".into(), Value::String(format!("/{}", self.id)));
        }
        properties
    }
}

impl Forge for EfsForge {
    fn merge_configs(
        &self,
        defaults: &dyn InstanceConfig,
        instance: &dyn InstanceConfig,
    ) -> Result<Box<dyn InstanceConfig>> {
        let mut merged = merge_typed::<EfsConfig>(defaults, instance)?;
        merged
            .removal_policy
            .get_or_insert_with(|| DEFAULT_REMOVAL_POLICY.to_string());
        Ok(Box::new(merged))
    }

    fn create(&mut self, ctx: &ForgeContext<'_>) -> Result<()> {
        let config = ctx.config::<EfsConfig>()?;
        self.id = config.base.id().to_string();
        let group = ctx.require_security_groups()?.default.clone();

        let file_system_id = logical_id(&["file-system", &self.id]);
        let mut properties = json!({
            "Encrypted": config.encrypted.unwrap_or(true),
            "PerformanceMode": config.performance_mode.as_deref().unwrap_or("generalPurpose"),
            "FileSystemTags": [{ "Key": "Name", "Value": format!("{}-{}", ctx.stack.name(), self.id) }],
        });
        if let Some(mode) = &config.throughput_mode {
            properties["ThroughputMode"] = Value::String(mode.clone());
        }
        let file_system =
            ctx.stack
                .add_resource(file_system_id.as_str(), "AWS::EFS::FileSystem", properties)?;
        let policy = config
            .removal_policy
            .as_deref()
            .unwrap_or(DEFAULT_REMOVAL_POLICY);
        ctx.stack
            .set_deletion_policy(&file_system_id, deletion_policy(policy))?;

        for (i, subnet) in ctx.instance_subnets()?.iter().enumerate() {
            ctx.stack.add_resource(
                format!("{}MountTarget{}", file_system_id, i + 1),
                "AWS::EFS::MountTarget",
                json!({
                    "FileSystemId": file_system.to_value(),
                    "SubnetId": subnet.to_value(),
                    "SecurityGroups": [group.attr("GroupId")],
                }),
            )?;
        }

        tracing::info!("Declared file system {} ({})", self.id, policy);
        self.file_system = Some(file_system);
        self.security_group = Some(group);
        Ok(())
    }

    /// NFS from the public and private classes
    fn configure_rules(&self, ctx: &ForgeContext<'_>) -> Result<()> {
        let groups = ctx.require_security_groups()?;
        let target = self
            .security_group
            .as_ref()
            .ok_or_else(|| ForgeError::NotCreated(format!("efs {}", self.id)))?;

        let writer = ctx.rule_writer();
        writer.from_group(
            target,
            &groups.public,
            Protocol::Tcp,
            PortSpec::Single(NFS_PORT),
            "Allow NFS from public subnet",
        )?;
        writer.from_group(
            target,
            &groups.private,
            Protocol::Tcp,
            PortSpec::Single(NFS_PORT),
            "Allow NFS from private subnet",
        )?;
        Ok(())
    }

    fn create_outputs(&self, ctx: &ForgeContext<'_>) -> Result<()> {
        ctx.stack.add_output(
            logical_id(&["elastic-file-system", &self.id]),
            self.file_system()?.to_value(),
            "Elastic File System ID",
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_removal_policy_defaults_after_merge() {
        let forge = EfsForge::default();
        let mut instance = EfsConfig::default();
        instance.load(&json!({ "id": "data" })).unwrap();

        let merged = forge
            .merge_configs(&EfsConfig::default(), &instance)
            .unwrap();
        let merged = merged.downcast_ref::<EfsConfig>().unwrap();
        assert_eq!(merged.removal_policy.as_deref(), Some("RETAIN"));

        let mut destroy = EfsConfig::default();
        destroy.load(&json!({ "id": "data", "removePolicy": "DESTROY" })).unwrap();
        let merged = forge.merge_configs(&EfsConfig::default(), &destroy).unwrap();
        assert_eq!(
            merged.downcast_ref::<EfsConfig>().unwrap().removal_policy.as_deref(),
            Some("DESTROY")
        );
    }

    #[test]
    fn test_deletion_policy_names() {
        assert_eq!(deletion_policy("RETAIN"), "Retain");
        assert_eq!(deletion_policy("destroy"), "Delete");
        assert_eq!(deletion_policy("SNAPSHOT"), "Retain");
    }

    #[test]
    fn test_properties_before_create_are_empty() {
        assert!(EfsForge::default().properties().is_empty());
    }
}
