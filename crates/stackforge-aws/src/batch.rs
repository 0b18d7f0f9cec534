//! Batch compute forge
//!
//! A managed compute environment, its job queues and one container job
//! definition. Queues are an id-keyed list: an instance entry with the id of
//! a default queue refines it, new ids are added.

use crate::userdata::{UserData, base64_value};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use stackforge_core::merge::{Identified, Merge, merge_by_id, replace_if_non_empty, set_if_present};
use stackforge_core::stack::logical_id;
use stackforge_core::{
    BaseInstanceConfig, Forge, ForgeConfig, ForgeContext, ForgeError, InstanceConfig,
    Prerequisite, Properties, PropertySource, ResourceRef, Result, extract_by_type, merge_typed,
};

pub const DEFAULT_INSTANCE_ROLE_POLICIES: &str = "AmazonEC2ContainerServiceforEC2Role";
pub const DEFAULT_CONTAINER_IMAGE: &str = "public.ecr.aws/amazonlinux/amazonlinux:latest";
pub const DEFAULT_MAX_VCPUS: u32 = 256;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,

    /// `ENABLED` or `DISABLED`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

impl Merge for QueueConfig {
    fn merge(&mut self, other: Self) {
        set_if_present(&mut self.id, other.id);
        set_if_present(&mut self.priority, other.priority);
        set_if_present(&mut self.state, other.state);
    }
}

impl Identified for QueueConfig {
    fn identity(&self) -> Option<&str> {
        self.id.as_deref()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchConfig {
    #[serde(flatten)]
    pub base: BaseInstanceConfig,

    /// Comma separated, e.g. `m5.large,c5.xlarge`; `optimal` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_types: Option<String>,

    #[serde(default, rename = "minvCpus", skip_serializing_if = "Option::is_none")]
    pub min_vcpus: Option<u32>,

    #[serde(default, rename = "maxvCpus", skip_serializing_if = "Option::is_none")]
    pub max_vcpus: Option<u32>,

    #[serde(default, rename = "desiredvCpus", skip_serializing_if = "Option::is_none")]
    pub desired_vcpus: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation_strategy: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_image: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vcpus: Option<u32>,

    /// MiB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_role_policies: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub queues: Vec<QueueConfig>,
}

impl Merge for BatchConfig {
    fn merge(&mut self, other: Self) {
        self.base.merge(other.base);
        set_if_present(&mut self.instance_types, other.instance_types);
        set_if_present(&mut self.min_vcpus, other.min_vcpus);
        set_if_present(&mut self.max_vcpus, other.max_vcpus);
        set_if_present(&mut self.desired_vcpus, other.desired_vcpus);
        set_if_present(&mut self.allocation_strategy, other.allocation_strategy);
        set_if_present(&mut self.container_image, other.container_image);
        replace_if_non_empty(&mut self.command, other.command);
        set_if_present(&mut self.vcpus, other.vcpus);
        set_if_present(&mut self.memory, other.memory);
        set_if_present(&mut self.instance_role_policies, other.instance_role_policies);
        set_if_present(&mut self.depends_on, other.depends_on);
        merge_by_id(&mut self.queues, other.queues);
    }
}

impl ForgeConfig for BatchConfig {
    const KIND: &'static str = "batch";

    fn base(&self) -> &BaseInstanceConfig {
        &self.base
    }

    fn prerequisites(&self) -> Vec<Prerequisite> {
        vec![Prerequisite::InstanceProfile {
            policies: self
                .instance_role_policies
                .clone()
                .unwrap_or_else(|| DEFAULT_INSTANCE_ROLE_POLICIES.to_string()),
        }]
    }
}

impl BatchConfig {
    pub fn instance_types(&self) -> Vec<String> {
        let types: Vec<String> = self
            .instance_types
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        if types.is_empty() {
            vec!["optimal".to_string()]
        } else {
            types
        }
    }

    /// Configured queues, or a single default queue named after the instance
    pub fn effective_queues(&self) -> Vec<QueueConfig> {
        if !self.queues.is_empty() {
            return self.queues.clone();
        }
        vec![QueueConfig {
            id: Some(format!("{}-queue", self.base.id())),
            priority: Some(1),
            state: None,
        }]
    }
}

#[derive(Debug, Clone)]
struct CreatedQueue {
    id: String,
    queue: ResourceRef,
}

#[derive(Debug, Default)]
pub struct BatchForge {
    id: String,
    compute_environment: Option<ResourceRef>,
    job_definition: Option<ResourceRef>,
    queues: Vec<CreatedQueue>,
}

impl PropertySource for BatchForge {
    fn properties(&self) -> Properties {
        let mut properties = Properties::new();
        if let Some(environment) = &self.compute_environment {
            properties.insert("computeEnvironmentArn".into(), environment.to_value());
        }
        if let Some(definition) = &self.job_definition {
            properties.insert("jobDefinitionArn".into(), definition.to_value());
        }
        let queues: Vec<Value> = self
            .queues
            .iter()
            .map(|q| json!({ "id": q.id, "jobQueueArn": q.queue.to_value() }))
            .collect();
        properties.insert("jobQueues".into(), Value::Array(queues));
        properties
    }
}

impl Forge for BatchForge {
    fn merge_configs(
        &self,
        defaults: &dyn InstanceConfig,
        instance: &dyn InstanceConfig,
    ) -> Result<Box<dyn InstanceConfig>> {
        Ok(Box::new(merge_typed::<BatchConfig>(defaults, instance)?))
    }

    fn create(&mut self, ctx: &ForgeContext<'_>) -> Result<()> {
        let config = ctx.config::<BatchConfig>()?;
        self.id = config.base.id().to_string();
        let prefix = logical_id(&["batch", &self.id]);

        let (token, token_value) = match config.depends_on.as_deref() {
            Some(spec) if !spec.trim().is_empty() => {
                let bag = ctx.dependencies.resolve(spec)?;
                (bag.to_token()?, bag.to_token_value()?)
            }
            _ => (String::new(), Value::String(String::new())),
        };

        let group = ctx.require_security_groups()?.default.clone();
        let subnets: Vec<Value> = ctx
            .instance_subnets()?
            .iter()
            .map(ResourceRef::to_value)
            .collect();
        let profile = ctx
            .prerequisites
            .instance_profile
            .as_ref()
            .ok_or_else(|| ForgeError::NotCreated(format!("instance profile for {}", self.id)))?;

        let user_data = UserData {
            os_type: "linux",
            instance_id: &self.id,
            stack_name: ctx.stack.name(),
            magic_token: token_value.clone(),
        };
        let launch_template = ctx.stack.add_resource(
            format!("{}LaunchTemplate", prefix),
            "AWS::EC2::LaunchTemplate",
            json!({
                "LaunchTemplateData": {
                    "UserData": base64_value(user_data.render_multipart()),
                    "MetadataOptions": { "HttpTokens": "required" },
                },
            }),
        )?;

        let mut compute_resources = json!({
            "Type": "EC2",
            "AllocationStrategy": config.allocation_strategy.as_deref().unwrap_or("BEST_FIT_PROGRESSIVE"),
            "MinvCpus": config.min_vcpus.unwrap_or(0),
            "MaxvCpus": config.max_vcpus.unwrap_or(DEFAULT_MAX_VCPUS),
            "InstanceTypes": config.instance_types(),
            "Subnets": subnets,
            "SecurityGroupIds": [group.attr("GroupId")],
            "InstanceRole": profile.profile.to_value(),
            "LaunchTemplate": {
                "LaunchTemplateId": launch_template.to_value(),
                "Version": "$Latest",
            },
        });
        if let Some(desired) = config.desired_vcpus {
            compute_resources["DesiredvCpus"] = json!(desired);
        }
        let environment = ctx.stack.add_resource(
            format!("{}ComputeEnvironment", prefix),
            "AWS::Batch::ComputeEnvironment",
            json!({
                "Type": "MANAGED",
                "State": "ENABLED",
                "ComputeResources": compute_resources,
            }),
        )?;

        for queue in config.effective_queues() {
            let queue_id = queue.id.clone().unwrap_or_else(|| self.id.clone());
            let resource = ctx.stack.add_resource(
                logical_id(&["batch-queue", &self.id, &queue_id]),
                "AWS::Batch::JobQueue",
                json!({
                    "JobQueueName": format!("{}-{}", ctx.stack.name(), queue_id),
                    "Priority": queue.priority.unwrap_or(1),
                    "State": queue.state.as_deref().unwrap_or("ENABLED"),
                    "ComputeEnvironmentOrder": [
                        { "Order": 1, "ComputeEnvironment": environment.to_value() }
                    ],
                }),
            )?;
            self.queues.push(CreatedQueue {
                id: queue_id,
                queue: resource,
            });
        }

        let mut container = json!({
            "Image": config.container_image.as_deref().unwrap_or(DEFAULT_CONTAINER_IMAGE),
            "ResourceRequirements": [
                { "Type": "VCPU", "Value": config.vcpus.unwrap_or(1).to_string() },
                { "Type": "MEMORY", "Value": config.memory.unwrap_or(2048).to_string() },
            ],
            "Environment": [{ "Name": "STACKFORGE_DEPENDENCIES", "Value": token_value }],
        });
        if !config.command.is_empty() {
            container["Command"] = json!(config.command);
        }
        if let Some((volume, mount_point)) = efs_volume(&token)? {
            container["Volumes"] = json!([volume]);
            container["MountPoints"] = json!([mount_point]);
        }

        self.job_definition = Some(ctx.stack.add_resource(
            format!("{}JobDefinition", prefix),
            "AWS::Batch::JobDefinition",
            json!({
                "Type": "container",
                "JobDefinitionName": format!("{}-{}", ctx.stack.name(), self.id),
                "ContainerProperties": container,
            }),
        )?);
        self.compute_environment = Some(environment);

        tracing::info!("Declared batch environment {} with {} queue(s)", self.id, self.queues.len());
        Ok(())
    }

    fn create_outputs(&self, ctx: &ForgeContext<'_>) -> Result<()> {
        let environment = self
            .compute_environment
            .as_ref()
            .ok_or_else(|| ForgeError::NotCreated(format!("batch {}", self.id)))?;
        ctx.stack.add_output(
            logical_id(&["batch-compute-environment", &self.id]),
            environment.to_value(),
            "Batch compute environment ARN",
        );
        for queue in &self.queues {
            ctx.stack.add_output(
                logical_id(&["batch-job-queue", &queue.id]),
                queue.queue.to_value(),
                "Batch job queue ARN",
            );
        }
        Ok(())
    }
}

/// Container volume and mount point for the first EFS dependency in a token
fn efs_volume(token: &str) -> Result<Option<(Value, Value)>> {
    if token.is_empty() {
        return Ok(None);
    }
    let properties = match extract_by_type(token, "EFS") {
        Ok(properties) => properties,
        Err(ForgeError::DependencyTypeNotFound(_)) => return Ok(None),
        Err(e) => return Err(e),
    };

    let file_system_id = properties.get("fileSystemId").cloned().unwrap_or(Value::Null);
    let mount_point = properties
        .get("mountPoint")
        .and_then(Value::as_str)
        .unwrap_or("/mnt/efs")
        .to_string();
    Ok(Some((
        json!({
            "Name": "efs",
            "EfsVolumeConfiguration": {
                "FileSystemId": file_system_id,
                "TransitEncryption": "ENABLED",
            },
        }),
        json!({ "SourceVolume": "efs", "ContainerPath": mount_point, "ReadOnly": false }),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackforge_core::{DependencyBag, ResolvedDependency};

    fn config(value: Value) -> BatchConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_queues_merge_by_id() {
        let defaults = config(json!({
            "queues": [
                { "id": "high", "priority": 10 },
                { "id": "low", "priority": 1 }
            ]
        }));
        let instance = config(json!({
            "id": "jobs",
            "queues": [
                { "id": "low", "state": "DISABLED" },
                { "id": "gpu", "priority": 5 }
            ]
        }));

        let merged = stackforge_core::merge(&defaults, &instance);
        let ids: Vec<&str> = merged.queues.iter().filter_map(|q| q.id.as_deref()).collect();
        assert_eq!(ids, vec!["high", "low", "gpu"]);
        assert_eq!(merged.queues[1].priority, Some(1));
        assert_eq!(merged.queues[1].state.as_deref(), Some("DISABLED"));
    }

    #[test]
    fn test_defaults() {
        let batch = config(json!({ "id": "jobs", "instanceTypes": " m5.large , c5.xlarge,," }));
        assert_eq!(batch.instance_types(), vec!["m5.large", "c5.xlarge"]);
        assert_eq!(batch.effective_queues()[0].id.as_deref(), Some("jobs-queue"));
        assert_eq!(config(json!({})).instance_types(), vec!["optimal"]);
        assert_eq!(
            ForgeConfig::prerequisites(&batch),
            vec![Prerequisite::InstanceProfile {
                policies: DEFAULT_INSTANCE_ROLE_POLICIES.into()
            }]
        );
    }

    #[test]
    fn test_vcpu_keys() {
        let batch = config(json!({ "minvCpus": 2, "maxvCpus": 64 }));
        assert_eq!(batch.min_vcpus, Some(2));
        assert_eq!(batch.max_vcpus, Some(64));
    }

    #[test]
    fn test_efs_volume_from_token() {
        let mut properties = Properties::new();
        properties.insert("fileSystemId".into(), json!({ "Ref": "FileSystemData" }));
        properties.insert("mountPoint".into(), json!("/data"));

        let mut bag = DependencyBag::new();
        bag.push(
            "EFS:data",
            ResolvedDependency {
                kind: "EFS".into(),
                id: "data".into(),
                properties,
            },
        );
        let token = bag.to_token().unwrap();

        let (volume, mount) = efs_volume(&token).unwrap().unwrap();
        assert_eq!(
            volume["EfsVolumeConfiguration"]["FileSystemId"],
            json!({ "Ref": "FileSystemData" })
        );
        assert_eq!(mount["ContainerPath"], "/data");

        assert!(efs_volume("").unwrap().is_none());
        let empty = DependencyBag::new().to_token().unwrap();
        assert!(efs_volume(&empty).unwrap().is_none());
    }
}
