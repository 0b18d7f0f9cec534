//! Forge trait definition

use crate::config::{SecurityClass, SubnetClass};
use crate::dependency::DependencyStore;
use crate::error::{ForgeError, Result};
use crate::instance::{ForgeConfig, InstanceConfig};
use crate::rules::{RuleRegistry, RuleWriter};
use crate::settings::RunSettings;
use crate::shared::MaterializedPrerequisites;
use crate::stack::{ResourceRef, Stack};
use std::collections::BTreeMap;

/// Public properties a created resource exposes to its dependents
pub type Properties = serde_json::Map<String, serde_json::Value>;

/// Property extraction capability required of every stored forge
pub trait PropertySource: Send + Sync {
    fn properties(&self) -> Properties;
}

/// Pluggable provisioner for one resource type
///
/// The manager drives the lifecycle in a fixed order for every enabled id:
/// `merge_configs`, `create`, `configure_rules`, `create_outputs`.
pub trait Forge: PropertySource {
    /// Combine the type defaults with one instance's overrides
    fn merge_configs(
        &self,
        defaults: &dyn InstanceConfig,
        instance: &dyn InstanceConfig,
    ) -> Result<Box<dyn InstanceConfig>>;

    /// Declare the primary resource
    fn create(&mut self, ctx: &ForgeContext<'_>) -> Result<()>;

    /// Declare network access rules through the rule registry
    fn configure_rules(&self, _ctx: &ForgeContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Surface results as stack outputs
    fn create_outputs(&self, _ctx: &ForgeContext<'_>) -> Result<()> {
        Ok(())
    }

    /// The created network, for the forge that builds the network foundation
    fn network(&self) -> Option<NetworkHandle> {
        None
    }
}

/// The network foundation shared by every forge in a run
#[derive(Debug, Clone)]
pub struct NetworkHandle {
    pub id: String,
    pub vpc: ResourceRef,
    pub cidr: String,
    pub existing: bool,
    pub dual_stack: bool,
    pub availability_zones: Vec<String>,
    pub subnets: BTreeMap<SubnetClass, Vec<ResourceRef>>,
}

impl NetworkHandle {
    /// Subnets of one class, one per availability zone
    pub fn subnets(&self, class: SubnetClass) -> &[ResourceRef] {
        self.subnets.get(&class).map(Vec::as_slice).unwrap_or_default()
    }
}

/// Security groups of one forge invocation.
///
/// `default` is the group selected by the instance's declared class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityGroups {
    pub default: ResourceRef,
    pub public: ResourceRef,
    pub private: ResourceRef,
    pub isolated: ResourceRef,
}

impl SecurityGroups {
    pub fn for_class(&self, class: SecurityClass) -> &ResourceRef {
        match class {
            SecurityClass::Public => &self.public,
            SecurityClass::Private => &self.private,
            SecurityClass::Isolated => &self.isolated,
        }
    }

    /// Copy with `default` pointing at the group of `class`
    pub fn with_default(&self, class: SecurityClass) -> Self {
        Self {
            default: self.for_class(class).clone(),
            ..self.clone()
        }
    }
}

/// Everything one forge invocation may use; lives for a single lifecycle.
pub struct ForgeContext<'a> {
    pub stack: &'a Stack,
    pub instance: &'a dyn InstanceConfig,
    pub network: Option<&'a NetworkHandle>,
    pub subnet: SubnetClass,
    pub security_groups: Option<SecurityGroups>,
    pub dependencies: &'a DependencyStore,
    pub rules: &'a RuleRegistry,
    pub prerequisites: &'a MaterializedPrerequisites,
    pub settings: &'a RunSettings,
}

impl<'a> ForgeContext<'a> {
    /// The merged configuration as the forge's own type
    pub fn config<T: ForgeConfig>(&self) -> Result<&'a T> {
        self.instance.downcast_ref::<T>()
    }

    pub fn require_network(&self) -> Result<&'a NetworkHandle> {
        self.network.ok_or(ForgeError::MissingNetwork)
    }

    pub fn require_security_groups(&self) -> Result<&SecurityGroups> {
        self.security_groups
            .as_ref()
            .ok_or(ForgeError::MissingNetwork)
    }

    /// Subnets of the instance's declared class
    pub fn instance_subnets(&self) -> Result<&'a [ResourceRef]> {
        Ok(self.require_network()?.subnets(self.subnet))
    }

    pub fn rule_writer(&self) -> RuleWriter<'a> {
        self.rules.writer(self.stack)
    }

    pub fn dual_stack(&self) -> bool {
        self.settings.dual_stack
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn groups() -> SecurityGroups {
        SecurityGroups {
            default: ResourceRef::created("PrivateSg"),
            public: ResourceRef::created("PublicSg"),
            private: ResourceRef::created("PrivateSg"),
            isolated: ResourceRef::created("IsolatedSg"),
        }
    }

    #[test]
    fn test_security_group_selection() {
        let groups = groups();
        assert_eq!(groups.for_class(SecurityClass::Public).identity(), "PublicSg");

        let isolated = groups.with_default(SecurityClass::Isolated);
        assert_eq!(isolated.default.identity(), "IsolatedSg");
        assert_eq!(isolated.public, groups.public);
    }

    #[test]
    fn test_network_subnets_by_class() {
        let mut subnets = BTreeMap::new();
        subnets.insert(
            SubnetClass::Public,
            vec![ResourceRef::created("PublicSubnet1")],
        );
        let network = NetworkHandle {
            id: "main".into(),
            vpc: ResourceRef::created("Vpc"),
            cidr: "10.0.0.0/16".into(),
            existing: false,
            dual_stack: false,
            availability_zones: vec!["us-east-1a".into()],
            subnets,
        };
        assert_eq!(network.subnets(SubnetClass::Public).len(), 1);
        assert!(network.subnets(SubnetClass::Isolated).is_empty());
    }
}
