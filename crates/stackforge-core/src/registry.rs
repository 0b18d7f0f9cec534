//! Forge registry
//!
//! Two lookup tables keyed by type name: forge constructors and blank
//! configuration creators. Built-in and third-party forges register into the
//! same registry before the orchestrator runs; the registry has no teardown.

use crate::error::{ForgeError, Result};
use crate::forge::Forge;
use crate::instance::{ForgeConfig, InstanceConfig};
use std::collections::BTreeMap;

/// Builds a fresh forge for one instance
pub type ForgeConstructor = fn() -> Box<dyn Forge>;

/// Builds a blank configuration to decode raw documents into
pub type InstanceCreator = fn() -> Box<dyn InstanceConfig>;

#[derive(Debug, Clone, Default)]
pub struct ForgeRegistry {
    constructors: BTreeMap<String, ForgeConstructor>,
    creators: BTreeMap<String, InstanceCreator>,
}

fn construct<F: Forge + Default + 'static>() -> Box<dyn Forge> {
    Box::new(F::default())
}

fn blank<C: ForgeConfig>() -> Box<dyn InstanceConfig> {
    Box::new(C::default())
}

impl ForgeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a forge constructor; a later registration replaces an earlier one.
    pub fn register_forge(&mut self, kind: impl Into<String>, constructor: ForgeConstructor) {
        let kind = kind.into();
        if self.constructors.insert(kind.clone(), constructor).is_some() {
            tracing::warn!("Replaced forge constructor for {}", kind);
        } else {
            tracing::debug!("Registered forge {}", kind);
        }
    }

    /// Register the blank configuration creator of a type.
    ///
    /// # Panics
    ///
    /// Registering the same type twice is a programming error and panics.
    pub fn register_instance_creator(&mut self, kind: impl Into<String>, creator: InstanceCreator) {
        let kind = kind.into();
        if self.creators.contains_key(&kind) {
            panic!("instance creator for forge type '{}' is already registered", kind);
        }
        self.creators.insert(kind, creator);
    }

    /// Register forge `F` with configuration `C` under `C::KIND`
    pub fn register<F, C>(&mut self)
    where
        F: Forge + Default + 'static,
        C: ForgeConfig,
    {
        self.register_forge(C::KIND, construct::<F>);
        self.register_instance_creator(C::KIND, blank::<C>);
    }

    pub fn create_forge(&self, kind: &str) -> Result<Box<dyn Forge>> {
        self.constructors
            .get(kind)
            .map(|constructor| constructor())
            .ok_or_else(|| ForgeError::UnknownForgeType(kind.to_string()))
    }

    /// Blank configuration for `kind`, or `None` for an unknown type
    pub fn create_instance(&self, kind: &str) -> Option<Box<dyn InstanceConfig>> {
        self.creators.get(kind).map(|creator| creator())
    }

    pub fn has_forge(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }

    /// Registered forge type names, sorted
    pub fn forge_types(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    pub fn instance_types(&self) -> Vec<&str> {
        self.creators.keys().map(String::as_str).collect()
    }
}
