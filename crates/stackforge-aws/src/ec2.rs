//! Compute instance forge
//!
//! One instance, or `instanceCount` numbered replicas `<id>.1 .. <id>.n`
//! stored together under the original id. The dependency token of
//! `dependsOn` is written into every replica's user data.

use crate::userdata::{UserData, base64_value};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use stackforge_core::merge::{Merge, set_if_present};
use stackforge_core::stack::logical_id;
use stackforge_core::{
    BaseInstanceConfig, Forge, ForgeConfig, ForgeContext, ForgeError, InstanceConfig,
    Prerequisite, Properties, PropertySource, ResourceRef, Result, merge_typed,
};

pub const DEFAULT_INSTANCE_TYPE: &str = "t3.micro";
pub const DEFAULT_PLACEMENT_STRATEGY: &str = "cluster";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ec2Config {
    #[serde(flatten)]
    pub base: BaseInstanceConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_count: Option<u32>,

    /// `linux` or `windows`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,

    /// `x86_64` or `arm64`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_arch: Option<String>,

    /// Explicit image id; overrides the OS lookup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_name: Option<String>,

    /// Comma separated managed policy names
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policies: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement_group: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement_group_strategy: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_efa: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ebs_size: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ebs_volume_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ebs_device_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detailed_monitoring: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_imdsv2: Option<bool>,

    /// e.g. `22@10.0.0.0/8;80,443@0.0.0.0/0`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_ports: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_ports_ipv6: Option<String>,

    /// Comma separated `TYPE:id` tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<String>,
}

impl Merge for Ec2Config {
    fn merge(&mut self, other: Self) {
        self.base.merge(other.base);
        set_if_present(&mut self.instance_type, other.instance_type);
        set_if_present(&mut self.instance_count, other.instance_count);
        set_if_present(&mut self.os_type, other.os_type);
        set_if_present(&mut self.os_name, other.os_name);
        set_if_present(&mut self.os_version, other.os_version);
        set_if_present(&mut self.os_arch, other.os_arch);
        set_if_present(&mut self.os_image, other.os_image);
        set_if_present(&mut self.key_name, other.key_name);
        set_if_present(&mut self.policies, other.policies);
        set_if_present(&mut self.placement_group, other.placement_group);
        set_if_present(&mut self.placement_group_strategy, other.placement_group_strategy);
        set_if_present(&mut self.enable_efa, other.enable_efa);
        set_if_present(&mut self.ebs_size, other.ebs_size);
        set_if_present(&mut self.ebs_volume_type, other.ebs_volume_type);
        set_if_present(&mut self.ebs_device_name, other.ebs_device_name);
        set_if_present(&mut self.detailed_monitoring, other.detailed_monitoring);
        set_if_present(&mut self.require_imdsv2, other.require_imdsv2);
        set_if_present(&mut self.allowed_ports, other.allowed_ports);
        set_if_present(&mut self.allowed_ports_ipv6, other.allowed_ports_ipv6);
        set_if_present(&mut self.depends_on, other.depends_on);
    }
}

impl ForgeConfig for Ec2Config {
    const KIND: &'static str = "ec2";

    fn base(&self) -> &BaseInstanceConfig {
        &self.base
    }

    fn prerequisites(&self) -> Vec<Prerequisite> {
        let mut prerequisites = vec![Prerequisite::KeyPair {
            name: self.key_name.clone().filter(|name| !name.is_empty()),
            os: self.os_type().to_string(),
        }];
        if let Some(name) = self.placement_group.as_deref().filter(|name| !name.is_empty()) {
            prerequisites.push(Prerequisite::PlacementGroup {
                name: name.to_string(),
                strategy: self
                    .placement_group_strategy
                    .clone()
                    .unwrap_or_else(|| DEFAULT_PLACEMENT_STRATEGY.to_string()),
            });
        }
        if let Some(policies) = self.policies.as_deref().filter(|p| !p.trim().is_empty()) {
            prerequisites.push(Prerequisite::InstanceProfile {
                policies: policies.to_string(),
            });
        }
        prerequisites
    }

    fn replicas(&self) -> u32 {
        self.instance_count.unwrap_or(1).max(1)
    }
}

impl Ec2Config {
    pub fn os_type(&self) -> &str {
        self.os_type.as_deref().unwrap_or("linux")
    }

    /// Replica ids; a single instance keeps its own id
    pub fn replica_ids(&self) -> Vec<String> {
        let id = self.base.id();
        let count = ForgeConfig::replicas(self);
        if count == 1 {
            return vec![id.to_string()];
        }
        (1..=count).map(|n| format!("{}.{}", id, n)).collect()
    }

    /// Image id, resolved through public SSM parameters unless given
    pub fn image_id(&self) -> String {
        if let Some(image) = self.os_image.as_deref().filter(|image| !image.is_empty()) {
            return image.to_string();
        }

        let arm = self.os_arch.as_deref() == Some("arm64");
        let parameter = if self.os_type().eq_ignore_ascii_case("windows") {
            let version = self.os_version.as_deref().unwrap_or("2022");
            format!(
                "/aws/service/ami-windows-latest/Windows_Server-{}-English-Full-Base",
                version
            )
        } else if self.os_name.as_deref() == Some("ubuntu") {
            format!(
                "/aws/service/canonical/ubuntu/server/{}/stable/current/{}/hvm/ebs-gp2/ami-id",
                self.os_version.as_deref().unwrap_or("22.04"),
                if arm { "arm64" } else { "amd64" }
            )
        } else {
            format!(
                "/aws/service/ami-amazon-linux-latest/al2023-ami-kernel-default-{}",
                if arm { "arm64" } else { "x86_64" }
            )
        };
        format!("{{{{resolve:ssm:{}}}}}", parameter)
    }
}

#[derive(Debug, Default)]
pub struct Ec2Forge {
    id: String,
    instance_type: String,
    os_name: String,
    os_version: String,
    instances: Vec<ResourceRef>,
}

impl PropertySource for Ec2Forge {
    fn properties(&self) -> Properties {
        let mut properties = Properties::new();
        properties.insert("instanceCount".into(), json!(self.instances.len()));
        properties.insert("instanceType".into(), Value::String(self.instance_type.clone()));
        properties.insert("osName".into(), Value::String(self.os_name.clone()));
        properties.insert("osVersion".into(), Value::String(self.os_version.clone()));
        let instances: Vec<Value> = self
            .instances
            .iter()
            .map(|instance| {
                json!({
                    "instanceId": instance.to_value(),
                    "instancePrivateIp": instance.attr("PrivateIp"),
                    "instancePrivateDnsName": instance.attr("PrivateDnsName"),
                })
            })
            .collect();
        properties.insert("instances".into(), Value::Array(instances));
        properties
    }
}

impl Forge for Ec2Forge {
    fn merge_configs(
        &self,
        defaults: &dyn InstanceConfig,
        instance: &dyn InstanceConfig,
    ) -> Result<Box<dyn InstanceConfig>> {
        let mut merged = merge_typed::<Ec2Config>(defaults, instance)?;
        merged
            .instance_type
            .get_or_insert_with(|| DEFAULT_INSTANCE_TYPE.to_string());
        Ok(Box::new(merged))
    }

    fn create(&mut self, ctx: &ForgeContext<'_>) -> Result<()> {
        let config = ctx.config::<Ec2Config>()?;
        self.id = config.base.id().to_string();
        self.instance_type = config
            .instance_type
            .clone()
            .unwrap_or_else(|| DEFAULT_INSTANCE_TYPE.to_string());
        self.os_name = config.os_name.clone().unwrap_or_default();
        self.os_version = config.os_version.clone().unwrap_or_default();

        let token = match config.depends_on.as_deref() {
            Some(spec) if !spec.trim().is_empty() => {
                ctx.dependencies.resolve(spec)?.to_token_value()?
            }
            _ => Value::Null,
        };

        let group = ctx.require_security_groups()?.default.clone();
        let subnets = ctx.instance_subnets()?;
        let image_id = config.image_id();

        for (i, replica) in config.replica_ids().iter().enumerate() {
            let mut properties = Map::new();
            properties.insert("InstanceType".into(), Value::String(self.instance_type.clone()));
            properties.insert("ImageId".into(), Value::String(image_id.clone()));

            let subnet = subnets.get(i % subnets.len().max(1)).map(ResourceRef::to_value);
            if config.enable_efa.unwrap_or(false) {
                let mut interface = json!({
                    "DeviceIndex": "0",
                    "InterfaceType": "efa",
                    "GroupSet": [group.attr("GroupId")],
                });
                if let Some(subnet) = subnet {
                    interface["SubnetId"] = subnet;
                }
                properties.insert("NetworkInterfaces".into(), json!([interface]));
            } else {
                properties.insert("SecurityGroupIds".into(), json!([group.attr("GroupId")]));
                if let Some(subnet) = subnet {
                    properties.insert("SubnetId".into(), subnet);
                }
            }

            if let Some(key_pair) = &ctx.prerequisites.key_pair {
                properties.insert("KeyName".into(), key_pair.resource.to_value());
            }
            if let Some(profile) = &ctx.prerequisites.instance_profile {
                properties.insert("IamInstanceProfile".into(), profile.profile.to_value());
            }
            if let Some(placement_group) = &ctx.prerequisites.placement_group {
                properties.insert("PlacementGroupName".into(), placement_group.resource.to_value());
            }
            if let Some(size) = config.ebs_size {
                properties.insert(
                    "BlockDeviceMappings".into(),
                    json!([{
                        "DeviceName": config.ebs_device_name.as_deref().unwrap_or("/dev/xvda"),
                        "Ebs": {
                            "VolumeSize": size,
                            "VolumeType": config.ebs_volume_type.as_deref().unwrap_or("gp3"),
                            "Encrypted": true,
                        },
                    }]),
                );
            }
            if config.detailed_monitoring.unwrap_or(false) {
                properties.insert("Monitoring".into(), Value::Bool(true));
            }
            if config.require_imdsv2.unwrap_or(true) {
                properties.insert("MetadataOptions".into(), json!({ "HttpTokens": "required" }));
            }

            let user_data = UserData {
                os_type: config.os_type(),
                instance_id: replica,
                stack_name: ctx.stack.name(),
                magic_token: token.clone(),
            };
            properties.insert("UserData".into(), base64_value(user_data.render()));
            properties.insert(
                "Tags".into(),
                json!([{ "Key": "Name", "Value": format!("{}-{}", ctx.stack.name(), replica) }]),
            );

            let instance = ctx.stack.add_resource(
                logical_id(&["instance", replica]),
                "AWS::EC2::Instance",
                Value::Object(properties),
            )?;
            self.instances.push(instance);
        }

        tracing::info!(
            "Declared {} instance(s) for {} ({})",
            self.instances.len(),
            self.id,
            self.instance_type
        );
        Ok(())
    }

    fn configure_rules(&self, ctx: &ForgeContext<'_>) -> Result<()> {
        let config = ctx.config::<Ec2Config>()?;
        let groups = ctx.require_security_groups()?;
        let writer = ctx.rule_writer();

        if config.allowed_ports.is_some() || config.allowed_ports_ipv6.is_some() {
            let applied = writer.apply_port_rules(
                &groups.public,
                config.allowed_ports.as_deref(),
                config.allowed_ports_ipv6.as_deref(),
                ctx.dual_stack(),
            )?;
            tracing::debug!("Applied {} port rules for {}", applied, self.id);
        }

        if config.enable_efa.unwrap_or(false) {
            writer.efa_self_rules(&groups.default)?;
            if groups.default != groups.private {
                writer.efa_self_rules(&groups.private)?;
            }
        }
        Ok(())
    }

    fn create_outputs(&self, ctx: &ForgeContext<'_>) -> Result<()> {
        if self.instances.is_empty() {
            return Err(ForgeError::NotCreated(format!("ec2 {}", self.id)));
        }
        let ids: Vec<Value> = self.instances.iter().map(ResourceRef::to_value).collect();
        ctx.stack.add_output(
            logical_id(&["elastic-cloud-compute", &self.id]),
            json!({ "Fn::Join": [",", ids] }),
            "List of all Elastic Cloud Compute IDs",
        );
        Ok(())
    }
}
