//! Synthesized stack
//!
//! Collects the resources and outputs declared by forges during a run and
//! renders them as a CloudFormation-style JSON template.

use crate::error::{ForgeError, Result};
use crate::hash::short_hash;
use crate::rules::{Direction, Peer, PortSpec, Protocol, RuleDescriptor, RuleSink};
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::sync::{Mutex, PoisonError};

/// Handle to a resource, either declared in this stack or imported by name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceRef {
    Created { logical_id: String },
    Imported { physical_id: String },
}

impl ResourceRef {
    pub fn created(logical_id: impl Into<String>) -> Self {
        ResourceRef::Created {
            logical_id: logical_id.into(),
        }
    }

    pub fn imported(physical_id: impl Into<String>) -> Self {
        ResourceRef::Imported {
            physical_id: physical_id.into(),
        }
    }

    pub fn is_imported(&self) -> bool {
        matches!(self, ResourceRef::Imported { .. })
    }

    /// Logical id for declared resources, physical id for imported ones
    pub fn identity(&self) -> &str {
        match self {
            ResourceRef::Created { logical_id } => logical_id,
            ResourceRef::Imported { physical_id } => physical_id,
        }
    }

    /// Value that references the resource in the template
    pub fn to_value(&self) -> Value {
        match self {
            ResourceRef::Created { logical_id } => json!({ "Ref": logical_id }),
            ResourceRef::Imported { physical_id } => Value::String(physical_id.clone()),
        }
    }

    /// Attribute reference; imported resources resolve to their physical id
    pub fn attr(&self, name: &str) -> Value {
        match self {
            ResourceRef::Created { logical_id } => json!({ "Fn::GetAtt": [logical_id, name] }),
            ResourceRef::Imported { physical_id } => Value::String(physical_id.clone()),
        }
    }
}

/// One declared resource
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StackResource {
    pub logical_id: String,
    pub resource_type: String,
    pub properties: Value,
    /// `Retain`, `Delete` or `Snapshot`; absent means the provider default
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<String>,
}

/// One declared output
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StackOutput {
    pub key: String,
    pub value: Value,
    pub description: String,
}

/// Resources and outputs of one run
#[derive(Debug, Default)]
pub struct Stack {
    name: String,
    description: String,
    resources: Mutex<Vec<StackResource>>,
    outputs: Mutex<Vec<StackOutput>>,
}

impl Stack {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declare a resource; logical ids must be unique within the stack.
    pub fn add_resource(
        &self,
        logical_id: impl Into<String>,
        resource_type: impl Into<String>,
        properties: Value,
    ) -> Result<ResourceRef> {
        let logical_id = logical_id.into();
        let mut resources = self.resources.lock().unwrap_or_else(PoisonError::into_inner);
        if resources.iter().any(|r| r.logical_id == logical_id) {
            return Err(ForgeError::DuplicateLogicalId(logical_id));
        }

        let resource_type = resource_type.into();
        tracing::debug!("Declared {} ({})", logical_id, resource_type);
        resources.push(StackResource {
            logical_id: logical_id.clone(),
            resource_type,
            properties,
            deletion_policy: None,
        });
        Ok(ResourceRef::created(logical_id))
    }

    /// Set the deletion policy of a declared resource
    pub fn set_deletion_policy(&self, logical_id: &str, policy: impl Into<String>) -> Result<()> {
        let mut resources = self.resources.lock().unwrap_or_else(PoisonError::into_inner);
        let resource = resources
            .iter_mut()
            .find(|r| r.logical_id == logical_id)
            .ok_or_else(|| ForgeError::NotCreated(logical_id.to_string()))?;
        resource.deletion_policy = Some(policy.into());
        Ok(())
    }

    /// Declare an output; a repeated key replaces the earlier value.
    pub fn add_output(&self, key: impl Into<String>, value: Value, description: impl Into<String>) {
        let key = key.into();
        let mut outputs = self.outputs.lock().unwrap_or_else(PoisonError::into_inner);
        outputs.retain(|o| o.key != key);
        outputs.push(StackOutput {
            key,
            value,
            description: description.into(),
        });
    }

    pub fn contains(&self, logical_id: &str) -> bool {
        self.resource(logical_id).is_some()
    }

    pub fn resource(&self, logical_id: &str) -> Option<StackResource> {
        self.resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|r| r.logical_id == logical_id)
            .cloned()
    }

    pub fn resources(&self) -> Vec<StackResource> {
        self.resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn resources_of_type(&self, resource_type: &str) -> Vec<StackResource> {
        self.resources()
            .into_iter()
            .filter(|r| r.resource_type == resource_type)
            .collect()
    }

    pub fn outputs(&self) -> Vec<StackOutput> {
        self.outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn resource_count(&self) -> usize {
        self.resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Render the template document
    pub fn to_template(&self) -> Value {
        let mut resources = Map::new();
        for resource in self.resources() {
            let mut entry = Map::new();
            entry.insert("Type".into(), Value::String(resource.resource_type));
            if let Some(policy) = resource.deletion_policy {
                entry.insert("DeletionPolicy".into(), Value::String(policy));
            }
            entry.insert("Properties".into(), resource.properties);
            resources.insert(resource.logical_id, Value::Object(entry));
        }

        let mut outputs = Map::new();
        for output in self.outputs() {
            let mut entry = Map::new();
            entry.insert("Value".into(), output.value);
            if !output.description.is_empty() {
                entry.insert("Description".into(), Value::String(output.description));
            }
            outputs.insert(output.key, Value::Object(entry));
        }

        let mut template = Map::new();
        template.insert(
            "AWSTemplateFormatVersion".into(),
            Value::String("2010-09-09".into()),
        );
        if !self.description.is_empty() {
            template.insert("Description".into(), Value::String(self.description.clone()));
        }
        template.insert("Resources".into(), Value::Object(resources));
        if !outputs.is_empty() {
            template.insert("Outputs".into(), Value::Object(outputs));
        }
        Value::Object(template)
    }
}

impl RuleSink for Stack {
    fn apply_rule(&self, rule: &RuleDescriptor, signature: &str) -> Result<()> {
        let (resource_type, prefix, peer_keys) = match rule.direction {
            Direction::Ingress => (
                "AWS::EC2::SecurityGroupIngress",
                "Ingress",
                ["SourceSecurityGroupId", "CidrIp", "CidrIpv6"],
            ),
            Direction::Egress => (
                "AWS::EC2::SecurityGroupEgress",
                "Egress",
                ["DestinationSecurityGroupId", "CidrIp", "CidrIpv6"],
            ),
        };

        let (from_port, to_port) = match (rule.protocol, rule.normalized_ports()) {
            (Protocol::All, _) => (-1, -1),
            (_, PortSpec::All) => (0, 65535),
            (_, PortSpec::Single(port)) => (i64::from(port), i64::from(port)),
            (_, PortSpec::Range(from, to)) => (i64::from(from), i64::from(to)),
        };

        let mut properties = Map::new();
        properties.insert("GroupId".into(), rule.target.attr("GroupId"));
        properties.insert(
            "IpProtocol".into(),
            Value::String(rule.protocol.as_str().into()),
        );
        properties.insert("FromPort".into(), json!(from_port));
        properties.insert("ToPort".into(), json!(to_port));
        match &rule.peer {
            Peer::Group(group) => {
                properties.insert(peer_keys[0].into(), group.attr("GroupId"));
            }
            Peer::Ipv4(cidr) => {
                properties.insert(peer_keys[1].into(), Value::String(cidr.clone()));
            }
            Peer::Ipv6(cidr) => {
                properties.insert(peer_keys[2].into(), Value::String(cidr.clone()));
            }
        }
        if let Some(description) = &rule.description {
            properties.insert("Description".into(), Value::String(description.clone()));
        }

        let logical_id = format!("{}{}", prefix, short_hash(signature));
        self.add_resource(logical_id, resource_type, Value::Object(properties))?;
        Ok(())
    }
}

/// A value the template engine resolves at deploy time (`Ref` or `Fn::*`)
pub fn is_intrinsic(value: &Value) -> bool {
    match value.as_object() {
        Some(map) if map.len() == 1 => map
            .keys()
            .all(|key| key == "Ref" || key.starts_with("Fn::")),
        _ => false,
    }
}

/// Concatenate literal text and intrinsic values.
///
/// Adjacent strings are merged and nested empty-delimiter joins are
/// flattened. Without any intrinsic part the result is a plain string.
pub fn join(parts: impl IntoIterator<Item = Value>) -> Value {
    fn push(parts: &mut Vec<Value>, value: Value) {
        if let Some(nested) = join_parts(&value) {
            for part in nested {
                push(parts, part.clone());
            }
            return;
        }
        match value {
            Value::String(text) if text.is_empty() => {}
            Value::String(text) => {
                if let Some(Value::String(last)) = parts.last_mut() {
                    last.push_str(&text);
                } else {
                    parts.push(Value::String(text));
                }
            }
            value => parts.push(value),
        }
    }

    let mut joined = Vec::new();
    for part in parts {
        push(&mut joined, part);
    }
    match joined.as_slice() {
        [] => Value::String(String::new()),
        [Value::String(text)] => Value::String(text.clone()),
        _ => json!({ "Fn::Join": ["", joined] }),
    }
}

fn join_parts(value: &Value) -> Option<&Vec<Value>> {
    match value.get("Fn::Join")?.as_array()?.as_slice() {
        [Value::String(delimiter), Value::Array(parts)] if delimiter.is_empty() => Some(parts),
        _ => None,
    }
}

/// Turn names into an alphanumeric logical id.
///
/// Lower-case kebab parts camel-case directly: `file-system` becomes
/// `FileSystem`. Any other part (dots, underscores, upper case, a word
/// starting with a digit) cannot be recovered from its camel-cased form, so
/// it also carries a hash of the raw part: `web.1` and `web-1` stay distinct
/// from `web1`.
pub fn logical_id(parts: &[&str]) -> String {
    let mut id = String::new();
    for part in parts {
        let mut upper_next = true;
        for c in part.chars() {
            if c.is_ascii_alphanumeric() {
                if upper_next {
                    id.push(c.to_ascii_uppercase());
                } else {
                    id.push(c);
                }
                upper_next = false;
            } else {
                upper_next = true;
            }
        }
        if !is_kebab(part) {
            id.push_str(&short_hash(part)[..LOGICAL_ID_HASH_LEN]);
        }
    }
    id
}

const LOGICAL_ID_HASH_LEN: usize = 8;

fn is_kebab(part: &str) -> bool {
    !part.is_empty()
        && part.split('-').all(|word| {
            word.starts_with(|c: char| c.is_ascii_lowercase())
                && word
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_resource_returns_ref() {
        let stack = Stack::new("demo", "");
        let vpc = stack
            .add_resource("Vpc", "AWS::EC2::VPC", json!({ "CidrBlock": "10.0.0.0/16" }))
            .unwrap();
        assert_eq!(vpc.to_value(), json!({ "Ref": "Vpc" }));
        assert_eq!(vpc.attr("CidrBlock"), json!({ "Fn::GetAtt": ["Vpc", "CidrBlock"] }));
        assert!(stack.contains("Vpc"));
        assert_eq!(stack.resource_count(), 1);
    }

    #[test]
    fn test_duplicate_logical_id_rejected() {
        let stack = Stack::new("demo", "");
        stack.add_resource("Vpc", "AWS::EC2::VPC", json!({})).unwrap();
        let err = stack
            .add_resource("Vpc", "AWS::EC2::VPC", json!({}))
            .unwrap_err();
        assert!(matches!(err, ForgeError::DuplicateLogicalId(id) if id == "Vpc"));
    }

    #[test]
    fn test_imported_ref() {
        let existing = ResourceRef::imported("vpc-123");
        assert!(existing.is_imported());
        assert_eq!(existing.to_value(), json!("vpc-123"));
        assert_eq!(existing.attr("VpcId"), json!("vpc-123"));
    }

    #[test]
    fn test_template_layout() {
        let stack = Stack::new("demo", "Demo stack");
        stack.add_resource("Vpc", "AWS::EC2::VPC", json!({})).unwrap();
        stack.add_output("VpcId", json!({ "Ref": "Vpc" }), "VPC id");
        stack.add_output("VpcId", json!({ "Ref": "Vpc" }), "replaced");

        let template = stack.to_template();
        assert_eq!(template["Description"], "Demo stack");
        assert_eq!(template["Resources"]["Vpc"]["Type"], "AWS::EC2::VPC");
        assert_eq!(template["Outputs"]["VpcId"]["Description"], "replaced");
        assert_eq!(stack.outputs().len(), 1);
    }

    #[test]
    fn test_deletion_policy() {
        let stack = Stack::new("demo", "");
        stack.add_resource("Fs", "AWS::EFS::FileSystem", json!({})).unwrap();
        stack.set_deletion_policy("Fs", "Retain").unwrap();
        assert!(stack.set_deletion_policy("Missing", "Retain").is_err());

        let template = stack.to_template();
        assert_eq!(template["Resources"]["Fs"]["DeletionPolicy"], "Retain");
    }

    #[test]
    fn test_join_keeps_intrinsics_as_values() {
        let joined = join([
            json!("a"),
            json!("b"),
            json!({ "Ref": "Fs" }),
            json!({ "Fn::Join": ["", ["c", { "Fn::GetAtt": ["Db", "Port"] }, "d"]] }),
            json!(""),
        ]);
        assert_eq!(
            joined,
            json!({ "Fn::Join": ["", ["ab", { "Ref": "Fs" }, "c", { "Fn::GetAtt": ["Db", "Port"] }, "d"]] })
        );
    }

    #[test]
    fn test_join_of_literals_is_a_string() {
        assert_eq!(join([json!("a"), json!("b")]), json!("ab"));
        assert_eq!(join(Vec::new()), json!(""));
        assert!(is_intrinsic(&json!({ "Ref": "Vpc" })));
        assert!(is_intrinsic(&json!({ "Fn::GetAtt": ["Vpc", "CidrBlock"] })));
        assert!(!is_intrinsic(&json!({ "Ref": "Vpc", "extra": 1 })));
        assert!(!is_intrinsic(&json!({ "mountPoint": "/data" })));
    }

    #[test]
    fn test_logical_id() {
        assert_eq!(logical_id(&["efs", "data", "mount"]), "EfsDataMount");
        assert_eq!(logical_id(&["file-system", "shared"]), "FileSystemShared");
        assert_eq!(logical_id(&["instance", "web1"]), "InstanceWeb1");

        let replica = logical_id(&["instance", "web.1"]);
        assert!(replica.starts_with("InstanceWeb1"));
        assert_eq!(replica.len(), "InstanceWeb1".len() + 8);
        assert!(replica.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(replica, logical_id(&["instance", "web.1"]));
    }

    #[test]
    fn test_logical_id_keeps_distinct_names_apart() {
        let names = ["web1", "web.1", "web-1", "web_1", "Web1", "my-db", "my_db", "myDb"];
        let ids: std::collections::HashSet<String> = names
            .iter()
            .map(|name| logical_id(&["instance", name]))
            .collect();
        assert_eq!(ids.len(), names.len());
    }
}
