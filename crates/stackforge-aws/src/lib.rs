//! Built-in AWS forges for Stackforge
//!
//! Each forge declares CloudFormation resources for one kind of AWS
//! infrastructure. The `vpc` forge is the network foundation every other
//! forge is placed into.
//!
//! | Type    | Resources                                            |
//! |---------|------------------------------------------------------|
//! | `vpc`   | VPC, subnets per class, gateways, route tables       |
//! | `ec2`   | Instances with key pair, placement group and profile |
//! | `efs`   | File system and mount targets                        |
//! | `rds`   | DB instance or Aurora cluster with a stored password |
//! | `batch` | Compute environment, job queues, job definition      |
//!
//! # Requirements
//!
//! - The `aws` CLI, for probing existing key pairs, placement groups,
//!   instance profiles and parameters (`AwsCliProbe`)
//!
//! # Example
//!
//! ```ignore
//! use stackforge_aws::{AwsCliProbe, builtin_registry};
//! use stackforge_core::{Orchestrator, RunSettings};
//! use std::sync::Arc;
//!
//! let settings = RunSettings::from_global(&config.global);
//! let probe = Arc::new(AwsCliProbe::new(&settings.region));
//! let mut orchestrator = Orchestrator::new(builtin_registry(), settings, probe);
//! let report = orchestrator.run(&config).await?;
//! ```

pub mod awscli;
pub mod batch;
pub mod ec2;
pub mod efs;
pub mod error;
pub mod rds;
pub mod userdata;
pub mod vpc;

pub use awscli::{AwsCli, AwsCliProbe};
pub use batch::{BatchConfig, BatchForge, QueueConfig};
pub use ec2::{Ec2Config, Ec2Forge};
pub use efs::{EfsConfig, EfsForge};
pub use error::{AwsError, Result};
pub use rds::{RdsConfig, RdsForge};
pub use userdata::UserData;
pub use vpc::{VpcConfig, VpcForge};

use stackforge_core::ForgeRegistry;

/// Register every built-in forge
pub fn register_builtin(registry: &mut ForgeRegistry) {
    registry.register::<VpcForge, VpcConfig>();
    registry.register::<Ec2Forge, Ec2Config>();
    registry.register::<EfsForge, EfsConfig>();
    registry.register::<RdsForge, RdsConfig>();
    registry.register::<BatchForge, BatchConfig>();
}

/// A registry holding the built-in forges
pub fn builtin_registry() -> ForgeRegistry {
    let mut registry = ForgeRegistry::new();
    register_builtin(&mut registry);
    registry
}
