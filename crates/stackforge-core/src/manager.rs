//! Orchestration manager
//!
//! One run per invocation: build the network foundation and the security
//! classes, then process every enabled id in listed order. A failing id is
//! reported and skipped; the run carries on with the next one.

use crate::config::{Config, ForgeSection};
use crate::dependency::{DependencyStore, store_key};
use crate::error::{ForgeError, Result};
use crate::forge::{Forge, ForgeContext, NetworkHandle, PropertySource, SecurityGroups};
use crate::instance::InstanceConfig;
use crate::network::create_security_groups;
use crate::registry::ForgeRegistry;
use crate::report::RunReport;
use crate::rules::RuleRegistry;
use crate::settings::RunSettings;
use crate::shared::{ExistenceProbe, SharedResources};
use crate::stack::Stack;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

/// Type name of the forge that builds the network foundation
pub const NETWORK_FORGE: &str = "vpc";

/// Run-scoped state shared by every forge invocation
pub struct RunSession {
    pub stack: Stack,
    pub dependencies: DependencyStore,
    pub rules: RuleRegistry,
    pub shared: SharedResources,
}

impl RunSession {
    pub fn new(settings: &RunSettings, probe: Arc<dyn ExistenceProbe>) -> Self {
        Self {
            stack: Stack::new(settings.stack_name.clone(), settings.description.clone()),
            dependencies: DependencyStore::new(),
            rules: RuleRegistry::new(),
            shared: SharedResources::new(probe),
        }
    }
}

/// Outcome of one successfully processed id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Processed {
    pub id: String,
    pub kind: String,
    pub key: String,
}

pub struct Orchestrator {
    registry: ForgeRegistry,
    settings: RunSettings,
    session: RunSession,
    network_id: Option<String>,
    network: Option<NetworkHandle>,
    security_groups: Option<SecurityGroups>,
}

impl Orchestrator {
    pub fn new(registry: ForgeRegistry, settings: RunSettings, probe: Arc<dyn ExistenceProbe>) -> Self {
        let session = RunSession::new(&settings, probe);
        Self {
            registry,
            settings,
            session,
            network_id: None,
            network: None,
            security_groups: None,
        }
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub fn session(&self) -> &RunSession {
        &self.session
    }

    pub fn into_session(self) -> RunSession {
        self.session
    }

    pub fn network(&self) -> Option<&NetworkHandle> {
        self.network.as_ref()
    }

    pub fn security_groups(&self) -> Option<&SecurityGroups> {
        self.security_groups.as_ref()
    }

    /// Run the whole configuration.
    ///
    /// Fails only when the network foundation cannot be built; per-id
    /// failures end up in the report.
    pub async fn run(&mut self, config: &Config) -> Result<RunReport> {
        let started = Instant::now();
        let mut report = RunReport::new(self.settings.stack_name.clone());

        report.network = Some(self.init(config).await?);

        for id in &config.enabled_forges {
            let kind = config.find_instance(id).map(|(kind, _, _)| kind.to_string());
            if kind.as_deref() == Some(NETWORK_FORGE) {
                if self.network_id.as_deref() == Some(id.as_str()) {
                    tracing::debug!("Skipping {}: built as the network foundation", id);
                    report.skipped.push(id.clone());
                } else {
                    let e = ForgeError::processing(
                        id.clone(),
                        ForgeError::invalid_config(
                            id.clone(),
                            "only the first network instance is built",
                        ),
                    );
                    tracing::error!("{}", e);
                    report.add_failure(id.clone(), kind, e.to_string());
                }
                continue;
            }

            match self.process_id(config, id).await {
                Ok(processed) => {
                    tracing::info!("Processed {} ({})", id, processed.kind);
                    report.add_success(processed.id, processed.kind, processed.key);
                }
                Err(e) => {
                    let e = ForgeError::processing(id.clone(), e);
                    tracing::error!("{}", e);
                    report.add_failure(id.clone(), kind, e.to_string());
                }
            }
        }

        report.finish(started);
        tracing::info!("Run finished: {}", report);
        Ok(report)
    }

    /// Build the network foundation and the security classes derived from it.
    ///
    /// The network configuration is the type defaults merged with its first
    /// instance. Returns the dependency key the network was stored under.
    pub async fn init(&mut self, config: &Config) -> Result<String> {
        let kind = NETWORK_FORGE;
        let empty = ForgeSection::default();
        let section = config.forges.get(kind).unwrap_or(&empty);
        let raw = section.instances.first().unwrap_or(&Value::Null);

        let mut forge = self.registry.create_forge(kind)?;
        let merged = self.merged_config(forge.as_ref(), kind, section, raw)?;
        let id = if merged.id().is_empty() {
            "default".to_string()
        } else {
            merged.id().to_string()
        };
        tracing::info!("Creating network foundation {}", id);

        let prerequisites = self
            .session
            .shared
            .materialize(&self.session.stack, &self.settings, &merged.prerequisites())
            .await?;

        let network = {
            let ctx = ForgeContext {
                stack: &self.session.stack,
                instance: merged.as_ref(),
                network: None,
                subnet: merged.base().subnet_class(),
                security_groups: None,
                dependencies: &self.session.dependencies,
                rules: &self.session.rules,
                prerequisites: &prerequisites,
                settings: &self.settings,
            };
            forge.create(&ctx)?;
            forge.network().ok_or(ForgeError::MissingNetwork)?
        };

        let groups = create_security_groups(&self.session.stack, &self.session.rules, &network)?;

        let forge: Arc<dyn Forge> = Arc::from(forge);
        let key = store_key(kind, &id, merged.replicas());
        self.session
            .dependencies
            .store(key.clone(), forge.clone() as Arc<dyn PropertySource>);

        {
            let ctx = ForgeContext {
                stack: &self.session.stack,
                instance: merged.as_ref(),
                network: Some(&network),
                subnet: merged.base().subnet_class(),
                security_groups: Some(groups.clone()),
                dependencies: &self.session.dependencies,
                rules: &self.session.rules,
                prerequisites: &prerequisites,
                settings: &self.settings,
            };
            forge.configure_rules(&ctx)?;
            forge.create_outputs(&ctx)?;
        }

        tracing::info!("Network ready: {}", key);
        self.network_id = Some(id);
        self.network = Some(network);
        self.security_groups = Some(groups);
        Ok(key)
    }

    /// Process one enabled id: merge, materialize prerequisites, run the forge
    /// lifecycle and store the result for dependents.
    pub async fn process_id(&self, config: &Config, id: &str) -> Result<Processed> {
        tracing::debug!("Processing {}", id);
        let (kind, section, raw) = config
            .find_instance(id)
            .ok_or_else(|| ForgeError::InstanceNotFound(id.to_string()))?;
        let network = self.network.as_ref().ok_or(ForgeError::MissingNetwork)?;
        let groups = self
            .security_groups
            .as_ref()
            .ok_or(ForgeError::MissingNetwork)?;

        let mut forge = self.registry.create_forge(kind)?;
        let merged = self.merged_config(forge.as_ref(), kind, section, raw)?;

        let prerequisites = self
            .session
            .shared
            .materialize(&self.session.stack, &self.settings, &merged.prerequisites())
            .await?;

        let ctx = ForgeContext {
            stack: &self.session.stack,
            instance: merged.as_ref(),
            network: Some(network),
            subnet: merged.base().subnet_class(),
            security_groups: Some(groups.with_default(merged.base().security_class())),
            dependencies: &self.session.dependencies,
            rules: &self.session.rules,
            prerequisites: &prerequisites,
            settings: &self.settings,
        };

        forge.create(&ctx)?;
        let forge: Arc<dyn Forge> = Arc::from(forge);
        let key = store_key(kind, merged.id(), merged.replicas());
        self.session
            .dependencies
            .store(key.clone(), forge.clone() as Arc<dyn PropertySource>);

        forge.configure_rules(&ctx)?;
        forge.create_outputs(&ctx)?;

        Ok(Processed {
            id: id.to_string(),
            kind: kind.to_string(),
            key,
        })
    }

    /// Decode defaults and instance into blank configurations and merge them
    fn merged_config(
        &self,
        forge: &dyn Forge,
        kind: &str,
        section: &ForgeSection,
        raw: &Value,
    ) -> Result<Box<dyn InstanceConfig>> {
        let blank = || {
            self.registry
                .create_instance(kind)
                .ok_or_else(|| ForgeError::UnknownForgeType(kind.to_string()))
        };

        let mut defaults = blank()?;
        defaults.load(&section.defaults)?;
        let mut instance = blank()?;
        instance.load(raw)?;

        forge.merge_configs(defaults.as_ref(), instance.as_ref())
    }
}
