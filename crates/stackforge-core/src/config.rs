//! Configuration document model
//!
//! The document is already validated, structurally typed data handed over by a
//! loader. Per-type `defaults` and `instances` stay as raw JSON until the
//! registry produces a blank instance of the right type to decode them into.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Root configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub global: GlobalConfig,

    /// Instance ids to provision, in order
    #[serde(default)]
    pub enabled_forges: Vec<String>,

    /// Forge sections indexed by type name
    #[serde(default)]
    pub forges: BTreeMap<String, ForgeSection>,
}

/// Global settings shared by every forge
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfig {
    #[serde(default)]
    pub stack_name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub dual_stack: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

/// Defaults and instances for one forge type
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForgeSection {
    #[serde(default)]
    pub defaults: Value,

    #[serde(default)]
    pub instances: Vec<Value>,
}

impl ForgeSection {
    /// Find the raw instance document carrying `id`
    pub fn instance(&self, id: &str) -> Option<&Value> {
        self.instances
            .iter()
            .find(|raw| raw.get("id").and_then(Value::as_str) == Some(id))
    }
}

impl Config {
    /// Locate an instance document by id across all forge types.
    ///
    /// Types are scanned in name order; the first match wins.
    pub fn find_instance(&self, id: &str) -> Option<(&str, &ForgeSection, &Value)> {
        self.forges.iter().find_map(|(kind, section)| {
            section
                .instance(id)
                .map(|raw| (kind.as_str(), section, raw))
        })
    }

    /// Whether any instance id appears twice within the same type
    pub fn duplicate_ids(&self) -> Vec<String> {
        let mut duplicates = Vec::new();
        for (kind, section) in &self.forges {
            let mut seen = std::collections::HashSet::new();
            for id in section.instances.iter().filter_map(|raw| raw.get("id")?.as_str()) {
                if !seen.insert(id) {
                    duplicates.push(format!("{}:{}", kind, id));
                }
            }
        }
        duplicates
    }
}

/// Subnet placement of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubnetClass {
    Public,
    Private,
    Isolated,
}

impl SubnetClass {
    pub const ALL: [SubnetClass; 3] = [
        SubnetClass::Public,
        SubnetClass::Private,
        SubnetClass::Isolated,
    ];

    /// Unknown or missing names fall back to private
    pub fn from_name(name: Option<&str>) -> Self {
        match name {
            Some("public") => SubnetClass::Public,
            Some("isolated") => SubnetClass::Isolated,
            _ => SubnetClass::Private,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubnetClass::Public => "public",
            SubnetClass::Private => "private",
            SubnetClass::Isolated => "isolated",
        }
    }
}

impl std::fmt::Display for SubnetClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Security boundary class a resource is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityClass {
    Public,
    Private,
    Isolated,
}

impl SecurityClass {
    /// Unknown or missing names fall back to private
    pub fn from_name(name: Option<&str>) -> Self {
        match name {
            Some("public") => SecurityClass::Public,
            Some("isolated") => SecurityClass::Isolated,
            _ => SecurityClass::Private,
        }
    }
}

/// Fields shared by every instance configuration.
///
/// Every field is optional so that presence, not zero values, decides
/// whether an instance overrides its defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseInstanceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,

    #[serde(rename = "security", default, skip_serializing_if = "Option::is_none")]
    pub security_group: Option<String>,
}

impl BaseInstanceConfig {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn id(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }

    pub fn subnet_class(&self) -> SubnetClass {
        SubnetClass::from_name(self.subnet.as_deref())
    }

    pub fn security_class(&self) -> SecurityClass {
        SecurityClass::from_name(self.security_group.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Config {
        serde_json::from_value(json!({
            "global": { "stackName": "test-stack", "dualStack": true },
            "enabledForges": ["data", "web"],
            "forges": {
                "vpc": { "defaults": { "cidrBlock": "10.0.0.0/16" }, "instances": [] },
                "efs": { "defaults": {}, "instances": [{ "id": "data", "type": "efs" }] },
                "ec2": {
                    "defaults": { "instanceType": "t3.micro" },
                    "instances": [{ "id": "web", "subnet": "public" }]
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_config_deserialize() {
        let config = sample();
        assert_eq!(config.global.stack_name, "test-stack");
        assert!(config.global.dual_stack);
        assert_eq!(config.enabled_forges, vec!["data", "web"]);
        assert_eq!(config.forges.len(), 3);
    }

    #[test]
    fn test_find_instance() {
        let config = sample();
        let (kind, _, raw) = config.find_instance("web").unwrap();
        assert_eq!(kind, "ec2");
        assert_eq!(raw["subnet"], "public");
        assert!(config.find_instance("missing").is_none());
    }

    #[test]
    fn test_duplicate_ids() {
        let mut config = sample();
        config
            .forges
            .get_mut("efs")
            .unwrap()
            .instances
            .push(json!({ "id": "data" }));
        assert_eq!(config.duplicate_ids(), vec!["efs:data".to_string()]);
    }

    #[test]
    fn test_class_fallbacks() {
        assert_eq!(SubnetClass::from_name(Some("public")), SubnetClass::Public);
        assert_eq!(SubnetClass::from_name(Some("bogus")), SubnetClass::Private);
        assert_eq!(SubnetClass::from_name(None), SubnetClass::Private);
        assert_eq!(
            SecurityClass::from_name(Some("isolated")),
            SecurityClass::Isolated
        );
    }

    #[test]
    fn test_base_serde_keys() {
        let base: BaseInstanceConfig = serde_json::from_value(json!({
            "id": "db", "type": "rds", "subnet": "isolated", "security": "isolated"
        }))
        .unwrap();
        assert_eq!(base.id(), "db");
        assert_eq!(base.kind.as_deref(), Some("rds"));
        assert_eq!(base.subnet_class(), SubnetClass::Isolated);
        assert_eq!(base.security_class(), SecurityClass::Isolated);
    }
}
