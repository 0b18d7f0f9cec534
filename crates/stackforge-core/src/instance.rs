//! Instance configuration types
//!
//! Forge authors write a plain struct implementing [`ForgeConfig`]. The
//! blanket impl turns it into an object-safe [`InstanceConfig`] so the
//! registry and manager can handle every type uniformly, and forges get
//! their concrete type back with [`downcast_ref`](dyn InstanceConfig::downcast_ref).

use crate::config::BaseInstanceConfig;
use crate::error::{ForgeError, Result};
use crate::merge::{Merge, merge};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::Any;
use std::fmt::Debug;

/// Shared resource an instance needs before its forge runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prerequisite {
    /// SSH key pair; `None` means the stack name
    KeyPair { name: Option<String>, os: String },
    PlacementGroup { name: String, strategy: String },
    /// Comma separated managed policy names
    InstanceProfile { policies: String },
    /// Generated password stored under an SSM parameter
    Secret { parameter: String, length: usize },
}

/// Typed configuration of one forge type
pub trait ForgeConfig:
    Merge + Clone + Default + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Registered type name, e.g. `"efs"`
    const KIND: &'static str;

    fn base(&self) -> &BaseInstanceConfig;

    fn prerequisites(&self) -> Vec<Prerequisite> {
        Vec::new()
    }

    /// Number of numbered replicas this instance materializes
    fn replicas(&self) -> u32 {
        1
    }
}

/// Object-safe view over any [`ForgeConfig`]
pub trait InstanceConfig: Any + Debug + Send + Sync {
    fn kind(&self) -> &'static str;

    fn base(&self) -> &BaseInstanceConfig;

    /// Replace the contents with a raw document; `null` keeps the blank value.
    fn load(&mut self, raw: &Value) -> Result<()>;

    fn prerequisites(&self) -> Vec<Prerequisite>;

    fn replicas(&self) -> u32;

    fn to_value(&self) -> Result<Value>;

    fn clone_box(&self) -> Box<dyn InstanceConfig>;

    fn as_any(&self) -> &dyn Any;
}

impl<T: ForgeConfig> InstanceConfig for T {
    fn kind(&self) -> &'static str {
        T::KIND
    }

    fn base(&self) -> &BaseInstanceConfig {
        ForgeConfig::base(self)
    }

    fn load(&mut self, raw: &Value) -> Result<()> {
        if raw.is_null() {
            return Ok(());
        }
        *self = serde_json::from_value(raw.clone()).map_err(|e| {
            let id = raw.get("id").and_then(Value::as_str).unwrap_or(T::KIND);
            ForgeError::invalid_config(id, e.to_string())
        })?;
        Ok(())
    }

    fn prerequisites(&self) -> Vec<Prerequisite> {
        ForgeConfig::prerequisites(self)
    }

    fn replicas(&self) -> u32 {
        ForgeConfig::replicas(self)
    }

    fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    fn clone_box(&self) -> Box<dyn InstanceConfig> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl<'a> dyn InstanceConfig + 'a {
    pub fn id(&self) -> &str {
        self.base().id()
    }

    /// Borrow the concrete configuration, or fail with `UnexpectedConfig`
    pub fn downcast_ref<T: ForgeConfig>(&self) -> Result<&T> {
        self.as_any()
            .downcast_ref::<T>()
            .ok_or(ForgeError::UnexpectedConfig {
                expected: T::KIND,
                found: self.kind(),
            })
    }
}

impl Clone for Box<dyn InstanceConfig> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Merge two type-erased configurations of type `T`
pub fn merge_typed<T: ForgeConfig>(
    defaults: &dyn InstanceConfig,
    instance: &dyn InstanceConfig,
) -> Result<T> {
    let defaults = defaults.downcast_ref::<T>()?;
    let instance = instance.downcast_ref::<T>()?;
    Ok(merge(defaults, instance))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::set_if_present;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct NetConfig {
        #[serde(flatten)]
        base: BaseInstanceConfig,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<u32>,
    }

    impl Merge for NetConfig {
        fn merge(&mut self, other: Self) {
            self.base.merge(other.base);
            set_if_present(&mut self.size, other.size);
        }
    }

    impl ForgeConfig for NetConfig {
        const KIND: &'static str = "net";

        fn base(&self) -> &BaseInstanceConfig {
            &self.base
        }
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct StoreConfig {
        #[serde(flatten)]
        base: BaseInstanceConfig,
    }

    impl Merge for StoreConfig {
        fn merge(&mut self, other: Self) {
            self.base.merge(other.base);
        }
    }

    impl ForgeConfig for StoreConfig {
        const KIND: &'static str = "store";

        fn base(&self) -> &BaseInstanceConfig {
            &self.base
        }

        fn prerequisites(&self) -> Vec<Prerequisite> {
            vec![Prerequisite::InstanceProfile {
                policies: "AmazonSSMManagedInstanceCore".into(),
            }]
        }
    }

    fn loaded<T: ForgeConfig>(raw: Value) -> Box<dyn InstanceConfig> {
        let mut config: Box<dyn InstanceConfig> = Box::new(T::default());
        config.load(&raw).unwrap();
        config
    }

    #[test]
    fn test_load_and_downcast() {
        let config = loaded::<NetConfig>(json!({ "id": "main", "size": 3 }));
        assert_eq!(config.kind(), "net");
        assert_eq!(config.id(), "main");
        assert_eq!(config.downcast_ref::<NetConfig>().unwrap().size, Some(3));
    }

    #[test]
    fn test_load_null_keeps_blank() {
        let config = loaded::<NetConfig>(Value::Null);
        assert_eq!(config.downcast_ref::<NetConfig>().unwrap(), &NetConfig::default());
    }

    #[test]
    fn test_load_rejects_wrong_shape() {
        let mut config: Box<dyn InstanceConfig> = Box::new(NetConfig::default());
        let err = config
            .load(&json!({ "id": "main", "size": "large" }))
            .unwrap_err();
        assert!(matches!(err, ForgeError::InvalidConfig { id, .. } if id == "main"));
    }

    #[test]
    fn test_downcast_mismatch_is_explicit() {
        let config = loaded::<StoreConfig>(json!({ "id": "s1" }));
        let err = config.downcast_ref::<NetConfig>().unwrap_err();
        assert!(matches!(
            err,
            ForgeError::UnexpectedConfig {
                expected: "net",
                found: "store"
            }
        ));
    }

    #[test]
    fn test_merge_typed() {
        let defaults = loaded::<NetConfig>(json!({ "size": 10 }));
        let empty = loaded::<NetConfig>(json!({ "id": "a" }));
        let sized = loaded::<NetConfig>(json!({ "id": "b", "size": 20 }));

        let merged = merge_typed::<NetConfig>(defaults.as_ref(), empty.as_ref()).unwrap();
        assert_eq!(merged.size, Some(10));
        assert_eq!(merged.base.id(), "a");

        let merged = merge_typed::<NetConfig>(defaults.as_ref(), sized.as_ref()).unwrap();
        assert_eq!(merged.size, Some(20));
    }

    #[test]
    fn test_erased_accessors() {
        let config = loaded::<StoreConfig>(json!({ "id": "s1", "subnet": "isolated" }));
        assert_eq!(config.replicas(), 1);
        assert_eq!(config.prerequisites().len(), 1);
        assert_eq!(config.to_value().unwrap()["subnet"], "isolated");

        let cloned = config.clone();
        assert_eq!(cloned.id(), "s1");
    }
}
