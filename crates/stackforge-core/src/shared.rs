//! Shared singleton resources
//!
//! Key pairs, placement groups, instance profiles and generated secrets are
//! needed by many instances but must exist once per logical key. Each kind is
//! memoized in a [`SingletonCache`]; on a miss the environment is probed for a
//! resource provisioned out of band so that re-runs import instead of
//! recreating it.

use crate::error::{ForgeError, Result};
use crate::hash::short_hash;
use crate::instance::Prerequisite;
use crate::settings::RunSettings;
use crate::stack::{ResourceRef, Stack};
use async_trait::async_trait;
use rand::Rng;
use rand::seq::SliceRandom;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Kinds of resources the existence probe can look up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    KeyPair,
    PlacementGroup,
    InstanceProfile,
    Parameter,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::KeyPair => write!(f, "key pair"),
            ResourceKind::PlacementGroup => write!(f, "placement group"),
            ResourceKind::InstanceProfile => write!(f, "instance profile"),
            ResourceKind::Parameter => write!(f, "parameter"),
        }
    }
}

/// Looks up resources that already exist in the target environment
#[async_trait]
pub trait ExistenceProbe: Send + Sync {
    async fn exists(&self, kind: ResourceKind, name: &str) -> Result<bool>;

    /// Current value of a stored secret parameter, if any
    async fn fetch_secret(&self, parameter: &str) -> Result<Option<String>>;
}

/// Probe for synthesis without access to an environment; nothing exists
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineProbe;

#[async_trait]
impl ExistenceProbe for OfflineProbe {
    async fn exists(&self, _kind: ResourceKind, _name: &str) -> Result<bool> {
        Ok(false)
    }

    async fn fetch_secret(&self, _parameter: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Create-or-get memoization for one resource kind.
///
/// The lock is held across the lookup and the factory, so each key is
/// initialized at most once even under concurrent callers.
pub struct SingletonCache<T> {
    kind: &'static str,
    entries: Mutex<HashMap<String, T>>,
}

impl<T: Clone> SingletonCache<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached value for `key`, running `init` on the first call.
    ///
    /// A failed `init` caches nothing.
    pub async fn get_or_init<F, Fut>(&self, key: &str, init: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut entries = self.entries.lock().await;
        if let Some(hit) = entries.get(key) {
            tracing::debug!("{} cache hit: {}", self.kind, key);
            return Ok(hit.clone());
        }

        tracing::debug!("{} cache miss: {}", self.kind, key);
        let value = init().await?;
        entries.insert(key.to_string(), value.clone());
        Ok(value)
    }

    /// Get-or-create with an existence lookup before the factory.
    ///
    /// A failing lookup is logged and treated as "not found".
    pub async fn get_or_create<L, LF, F>(&self, key: &str, lookup: L, factory: F) -> Result<T>
    where
        L: FnOnce() -> LF,
        LF: Future<Output = Result<Option<T>>>,
        F: FnOnce() -> Result<T>,
    {
        let kind = self.kind;
        self.get_or_init(key, || async move {
            let found = match lookup().await {
                Ok(found) => found,
                Err(e) => {
                    tracing::warn!("{} lookup failed, creating instead: {}", kind, e);
                    None
                }
            };
            match found {
                Some(existing) => Ok(existing),
                None => factory(),
            }
        })
        .await
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn get(&self, key: &str) -> Option<T> {
        self.entries.lock().await.get(key).cloned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPairHandle {
    pub name: String,
    pub key_type: String,
    pub resource: ResourceRef,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementGroupHandle {
    pub name: String,
    pub strategy: String,
    pub resource: ResourceRef,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceProfileHandle {
    pub name: String,
    pub policies: Vec<String>,
    pub profile: ResourceRef,
    /// `None` when the profile was imported
    pub role: Option<ResourceRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretHandle {
    pub parameter: String,
    pub value: String,
    pub resource: ResourceRef,
    /// Whether the value came from an existing parameter
    pub reused: bool,
}

/// Shared resources materialized for one instance
#[derive(Debug, Clone, Default)]
pub struct MaterializedPrerequisites {
    pub key_pair: Option<KeyPairHandle>,
    pub placement_group: Option<PlacementGroupHandle>,
    pub instance_profile: Option<InstanceProfileHandle>,
    pub secrets: BTreeMap<String, SecretHandle>,
}

impl MaterializedPrerequisites {
    pub fn secret(&self, parameter: &str) -> Result<&SecretHandle> {
        self.secrets
            .get(parameter)
            .ok_or_else(|| ForgeError::NotCreated(format!("secret {}", parameter)))
    }
}

/// One cache per shared resource kind, scoped to a run
pub struct SharedResources {
    probe: Arc<dyn ExistenceProbe>,
    key_pairs: SingletonCache<KeyPairHandle>,
    placement_groups: SingletonCache<PlacementGroupHandle>,
    instance_profiles: SingletonCache<InstanceProfileHandle>,
    secrets: SingletonCache<SecretHandle>,
}

impl SharedResources {
    pub fn new(probe: Arc<dyn ExistenceProbe>) -> Self {
        Self {
            probe,
            key_pairs: SingletonCache::new("key pair"),
            placement_groups: SingletonCache::new("placement group"),
            instance_profiles: SingletonCache::new("instance profile"),
            secrets: SingletonCache::new("secret"),
        }
    }

    /// Materialize every prerequisite of one instance, in order
    pub async fn materialize(
        &self,
        stack: &Stack,
        settings: &RunSettings,
        prerequisites: &[Prerequisite],
    ) -> Result<MaterializedPrerequisites> {
        let mut materialized = MaterializedPrerequisites::default();
        for prerequisite in prerequisites {
            match prerequisite {
                Prerequisite::KeyPair { name, os } => {
                    let handle = self.key_pair(stack, settings, name.as_deref(), os).await?;
                    materialized.key_pair = Some(handle);
                }
                Prerequisite::PlacementGroup { name, strategy } => {
                    let handle = self
                        .placement_group(stack, settings, name, strategy)
                        .await?;
                    materialized.placement_group = Some(handle);
                }
                Prerequisite::InstanceProfile { policies } => {
                    materialized.instance_profile =
                        self.instance_profile(stack, settings, policies).await?;
                }
                Prerequisite::Secret { parameter, length } => {
                    let handle = self.secret(stack, parameter, *length).await?;
                    materialized.secrets.insert(parameter.clone(), handle);
                }
            }
        }
        Ok(materialized)
    }

    /// Key pair named `<name>-<os>-<region>`; defaults to the stack name
    pub async fn key_pair(
        &self,
        stack: &Stack,
        settings: &RunSettings,
        name: Option<&str>,
        os: &str,
    ) -> Result<KeyPairHandle> {
        let name = name
            .filter(|name| !name.is_empty())
            .unwrap_or(settings.stack_name.as_str());
        let os = if os.eq_ignore_ascii_case("windows") {
            "windows"
        } else {
            "linux"
        };
        let full_name = format!("{}-{}-{}", name, os, settings.region);
        let key = short_hash(&full_name);

        self.key_pairs
            .get_or_init(&key, || async {
                let key_type = if os == "windows" { "rsa" } else { "ed25519" };
                let resource = stack.add_resource(
                    format!("KeyPair{}", key),
                    "AWS::EC2::KeyPair",
                    json!({
                        "KeyName": full_name,
                        "KeyType": key_type,
                        "KeyFormat": "pem",
                    }),
                )?;
                Ok(KeyPairHandle {
                    name: full_name.clone(),
                    key_type: key_type.to_string(),
                    resource,
                })
            })
            .await
    }

    /// Placement group named `<stack>-<name>`, imported when it already exists
    pub async fn placement_group(
        &self,
        stack: &Stack,
        settings: &RunSettings,
        name: &str,
        strategy: &str,
    ) -> Result<PlacementGroupHandle> {
        let full_name = format!("{}-{}", settings.stack_name, name);
        let strategy = placement_strategy(strategy);
        let key = short_hash(&format!("{}-{}", full_name, strategy));

        self.placement_groups
            .get_or_create(
                &key,
                || async {
                    let found = self
                        .probe
                        .exists(ResourceKind::PlacementGroup, &full_name)
                        .await?;
                    Ok(found.then(|| {
                        tracing::info!("Importing existing placement group {}", full_name);
                        PlacementGroupHandle {
                            name: full_name.clone(),
                            strategy: strategy.to_string(),
                            resource: ResourceRef::imported(full_name.clone()),
                        }
                    }))
                },
                || {
                    let resource = stack.add_resource(
                        format!("PlacementGroup{}", key),
                        "AWS::EC2::PlacementGroup",
                        json!({
                            "Strategy": strategy,
                            "Tags": [{ "Key": "Name", "Value": full_name }],
                        }),
                    )?;
                    Ok(PlacementGroupHandle {
                        name: full_name.clone(),
                        strategy: strategy.to_string(),
                        resource,
                    })
                },
            )
            .await
    }

    /// Role and instance profile carrying a set of managed policies.
    ///
    /// Keyed by the sorted policy list, so the same set in any order shares
    /// one profile. An empty list needs no profile.
    pub async fn instance_profile(
        &self,
        stack: &Stack,
        settings: &RunSettings,
        policies: &str,
    ) -> Result<Option<InstanceProfileHandle>> {
        let policies = sort_policies(policies);
        if policies.is_empty() {
            return Ok(None);
        }
        let key = short_hash(&policies.join(","));
        let profile_name = format!(
            "{}-InstanceProfile-{}-{}",
            settings.stack_name, settings.region, key
        );

        let handle = self
            .instance_profiles
            .get_or_create(
                &key,
                || async {
                    let found = self
                        .probe
                        .exists(ResourceKind::InstanceProfile, &profile_name)
                        .await?;
                    Ok(found.then(|| {
                        tracing::info!("Importing existing instance profile {}", profile_name);
                        InstanceProfileHandle {
                            name: profile_name.clone(),
                            policies: policies.clone(),
                            profile: ResourceRef::imported(profile_name.clone()),
                            role: None,
                        }
                    }))
                },
                || {
                    let role_name = format!(
                        "{}-InstanceRole-{}-{}",
                        settings.stack_name, settings.region, key
                    );
                    let policy_arns: Vec<String> = policies
                        .iter()
                        .map(|policy| {
                            if policy.starts_with("arn:") {
                                policy.clone()
                            } else {
                                settings.partition.managed_policy_arn(policy)
                            }
                        })
                        .collect();
                    let role = stack.add_resource(
                        format!("Role{}", key),
                        "AWS::IAM::Role",
                        json!({
                            "RoleName": role_name,
                            "AssumeRolePolicyDocument": {
                                "Version": "2012-10-17",
                                "Statement": [{
                                    "Effect": "Allow",
                                    "Principal": { "Service": settings.partition.ec2_principal() },
                                    "Action": "sts:AssumeRole",
                                }],
                            },
                            "ManagedPolicyArns": policy_arns,
                        }),
                    )?;
                    let profile = stack.add_resource(
                        format!("InstanceProfile{}", key),
                        "AWS::IAM::InstanceProfile",
                        json!({
                            "InstanceProfileName": profile_name,
                            "Roles": [role.to_value()],
                        }),
                    )?;
                    Ok(InstanceProfileHandle {
                        name: profile_name.clone(),
                        policies: policies.clone(),
                        profile,
                        role: Some(role),
                    })
                },
            )
            .await?;
        Ok(Some(handle))
    }

    /// Password stored under `parameter`.
    ///
    /// An existing parameter value is reused; the parameter is declared in the
    /// stack either way so that it stays owned by the stack across re-runs.
    pub async fn secret(&self, stack: &Stack, parameter: &str, length: usize) -> Result<SecretHandle> {
        self.secrets
            .get_or_init(parameter, || async {
                let existing = match self.probe.fetch_secret(parameter).await {
                    Ok(existing) => existing.filter(|value| !value.is_empty()),
                    Err(e) => {
                        tracing::warn!("Secret lookup for {} failed, generating: {}", parameter, e);
                        None
                    }
                };
                let reused = existing.is_some();
                let value = match existing {
                    Some(value) => value,
                    None => generate_password(length),
                };

                let resource = stack.add_resource(
                    format!("Parameter{}", short_hash(parameter)),
                    "AWS::SSM::Parameter",
                    json!({
                        "Name": parameter,
                        "Type": "String",
                        "Value": value,
                        "Description": format!("Secure password for {}", parameter),
                    }),
                )?;
                Ok(SecretHandle {
                    parameter: parameter.to_string(),
                    value,
                    resource,
                    reused,
                })
            })
            .await
    }
}

/// Trimmed, sorted, non-empty policy names from a comma separated list
pub fn sort_policies(policies: &str) -> Vec<String> {
    let mut sorted: Vec<String> = policies
        .split(',')
        .map(str::trim)
        .filter(|policy| !policy.is_empty())
        .map(str::to_string)
        .collect();
    sorted.sort();
    sorted
}

/// Normalize a placement strategy name; unknown names mean `spread`
pub fn placement_strategy(strategy: &str) -> &'static str {
    match strategy.trim().to_ascii_lowercase().as_str() {
        "cluster" => "cluster",
        "partition" => "partition",
        _ => "spread",
    }
}

const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";
/// Excludes ' " # & - \ < > / @ and space
const SPECIAL: &[u8] = b"`~!$%^*()_=+[]{}|;:,.?";

/// Random password with at least one lower, upper, digit and special character
pub fn generate_password(length: usize) -> String {
    let mut rng = rand::thread_rng();
    let classes = [LOWER, UPPER, DIGITS, SPECIAL];
    let all: Vec<u8> = classes.concat();

    let mut password: Vec<u8> = classes
        .iter()
        .map(|class| class[rng.gen_range(0..class.len())])
        .collect();
    while password.len() < length.max(classes.len()) {
        password.push(all[rng.gen_range(0..all.len())]);
    }
    password.shuffle(&mut rng);

    password.into_iter().map(char::from).collect()
}
