//! Stackforge orchestration core
//!
//! Turns a declarative configuration into a synthesized cloud stack by
//! running pluggable forges, one per resource type.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                 stackforge CLI                   │
//! │            (stackforge synth / validate)         │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │                stackforge-core                   │
//! │  ┌──────────────────────────────────────────┐   │
//! │  │              Orchestrator                 │   │
//! │  │  network → security groups → each id      │   │
//! │  └──────────────────────────────────────────┘   │
//! │  ┌────────────┐ ┌────────────┐ ┌────────────┐   │
//! │  │  Registry  │ │ Dependency │ │   Rules    │   │
//! │  │  + Merge   │ │   Store    │ │  Registry  │   │
//! │  └────────────┘ └────────────┘ └────────────┘   │
//! │  ┌──────────────────────────────────────────┐   │
//! │  │   Shared resources (singleton caches)     │   │
//! │  └──────────────────────────────────────────┘   │
//! └───────┬─────────────────┬───────────────────────┘
//!         │                 │
//! ┌───────▼───────┐ ┌───────▼───────┐
//! │ stackforge-aws │ │ stackforge-   │
//! │    forges     │ │    config     │
//! └───────────────┘ └───────────────┘
//! ```

pub mod config;
pub mod dependency;
pub mod error;
pub mod forge;
pub mod hash;
pub mod instance;
pub mod manager;
pub mod merge;
pub mod network;
pub mod registry;
pub mod report;
pub mod rules;
pub mod settings;
pub mod shared;
pub mod stack;

// Re-exports
pub use config::{BaseInstanceConfig, Config, ForgeSection, GlobalConfig, SecurityClass, SubnetClass};
pub use dependency::{
    DependencyBag, DependencyStore, ResolvedDependency, extract_by_type, original_id, store_key,
};
pub use error::{ForgeError, Result};
pub use forge::{Forge, ForgeContext, NetworkHandle, Properties, PropertySource, SecurityGroups};
pub use instance::{ForgeConfig, InstanceConfig, Prerequisite, merge_typed};
pub use manager::{NETWORK_FORGE, Orchestrator, Processed, RunSession};
pub use merge::{Identified, Merge, merge, merge_by_id, replace_if_non_empty, set_if_present};
pub use registry::ForgeRegistry;
pub use report::{IdOutcome, RunReport};
pub use rules::{
    Direction, Peer, PortRule, PortSpec, Protocol, RuleDescriptor, RuleRegistry, RuleSink,
    RuleVariant, RuleWriter, parse_allowed_ports,
};
pub use settings::{Partition, RunSettings};
pub use shared::{
    ExistenceProbe, InstanceProfileHandle, KeyPairHandle, MaterializedPrerequisites, OfflineProbe,
    PlacementGroupHandle, ResourceKind, SecretHandle, SharedResources, SingletonCache,
};
pub use stack::{ResourceRef, Stack, StackOutput, StackResource};
