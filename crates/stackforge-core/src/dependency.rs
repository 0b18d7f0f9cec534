//! Dependency resolution
//!
//! Forges are stored under `TYPE:id` right after they create their primary
//! resource. A dependent names what it needs with a comma separated list of
//! such tokens and receives a [`DependencyBag`] of the producers' properties,
//! which serializes to the token embedded in its initialization payload:
//!
//! ```json
//! { "dependencies": { "EFS:data": { "type": "EFS", "id": "data", "properties": { ... } } } }
//! ```

use crate::error::{ForgeError, Result};
use crate::forge::{Properties, PropertySource};
use crate::stack::{is_intrinsic, join};
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Registry key for a stored forge: upper-cased type, replica suffix stripped
/// when the instance materializes numbered replicas.
pub fn store_key(kind: &str, id: &str, replicas: u32) -> String {
    let id = if replicas > 1 {
        original_id(id)
    } else {
        id.to_string()
    };
    format!("{}:{}", kind.to_ascii_uppercase(), id)
}

/// Strip a trailing replica index: `web.2` becomes `web`
pub fn original_id(id: &str) -> String {
    regex::Regex::new(r"\.\d+$")
        .map(|suffix| suffix.replace(id, "").into_owned())
        .unwrap_or_else(|_| id.to_string())
}

/// Forges that produced resources in this run, keyed by `TYPE:id`
#[derive(Default)]
pub struct DependencyStore {
    entries: RwLock<HashMap<String, Arc<dyn PropertySource>>>,
}

impl fmt::Debug for DependencyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyStore")
            .field("keys", &self.keys())
            .finish()
    }
}

impl DependencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the producer stored under `key`
    pub fn store(&self, key: impl Into<String>, source: Arc<dyn PropertySource>) {
        let key = key.into();
        tracing::debug!("Stored dependency {}", key);
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, source);
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn PropertySource>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn properties(&self, key: &str) -> Option<Properties> {
        // clone out of the lock before calling into the forge
        self.get(key).map(|source| source.properties())
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve a comma separated list of `TYPE:id` tokens.
    ///
    /// An empty specification yields an empty bag. Tokens are trimmed; a token
    /// that does not split into exactly two non-empty parts is an
    /// `InvalidDependencyFormat`, a token nothing was stored under is a
    /// `ResourceNotFound`.
    pub fn resolve(&self, spec: &str) -> Result<DependencyBag> {
        let mut bag = DependencyBag::new();
        if spec.trim().is_empty() {
            return Ok(bag);
        }

        for token in spec.split(',').map(str::trim) {
            let parts: Vec<&str> = token.split(':').collect();
            let (kind, id) = match parts.as_slice() {
                [kind, id] if !kind.is_empty() && !id.is_empty() => (*kind, *id),
                _ => return Err(ForgeError::InvalidDependencyFormat(token.to_string())),
            };

            let key = format!("{}:{}", kind.to_ascii_uppercase(), id);
            let properties = self
                .properties(&key)
                .ok_or_else(|| ForgeError::ResourceNotFound(token.to_string()))?;

            bag.push(
                token,
                ResolvedDependency {
                    kind: kind.to_string(),
                    id: id.to_string(),
                    properties,
                },
            );
        }

        tracing::debug!("Resolved {} dependencies from '{}'", bag.len(), spec);
        Ok(bag)
    }
}

/// Properties of one resolved producer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedDependency {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    #[serde(default)]
    pub properties: Properties,
}

impl ResolvedDependency {
    /// A string property, or `PropertyNotFound`
    pub fn property_str(&self, name: &str) -> Result<&str> {
        self.properties
            .get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| ForgeError::PropertyNotFound {
                token: format!("{}:{}", self.kind, self.id),
                property: name.to_string(),
            })
    }
}

/// Resolved dependencies in the order they were requested
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DependencyBag {
    entries: Vec<(String, ResolvedDependency)>,
}

impl DependencyBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry; a repeated token replaces the earlier one in place
    pub fn push(&mut self, token: impl Into<String>, dependency: ResolvedDependency) {
        let token = token.into();
        match self.entries.iter_mut().find(|(existing, _)| *existing == token) {
            Some((_, slot)) => *slot = dependency,
            None => self.entries.push((token, dependency)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ResolvedDependency)> {
        self.entries
            .iter()
            .map(|(token, dependency)| (token.as_str(), dependency))
    }

    pub fn get(&self, token: &str) -> Option<&ResolvedDependency> {
        self.iter()
            .find(|(existing, _)| *existing == token)
            .map(|(_, dependency)| dependency)
    }

    /// First dependency of `kind` (case-insensitive)
    pub fn find_by_type(&self, kind: &str) -> Option<&ResolvedDependency> {
        self.iter()
            .map(|(_, dependency)| dependency)
            .find(|dependency| dependency.kind.eq_ignore_ascii_case(kind))
    }

    /// Dependency of `kind` with exactly `id`
    pub fn find(&self, kind: &str, id: &str) -> Option<&ResolvedDependency> {
        self.iter()
            .map(|(_, dependency)| dependency)
            .find(|dependency| dependency.kind.eq_ignore_ascii_case(kind) && dependency.id == id)
    }

    /// Properties of the first dependency of `kind`
    pub fn properties_of_type(&self, kind: &str) -> Result<&Properties> {
        self.find_by_type(kind)
            .map(|dependency| &dependency.properties)
            .ok_or_else(|| ForgeError::DependencyTypeNotFound(kind.to_string()))
    }

    /// Serialize to the token embedded in initialization payloads
    pub fn to_token(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// The token as a template value.
    ///
    /// Intrinsic properties (`{"Ref": ...}`, `{"Fn::GetAtt": ...}`) are cut
    /// out of the JSON text and spliced back as `Fn::Join` parts, so the
    /// template engine substitutes their resolved value inside the quotes.
    /// A bag of literals renders as the plain token string.
    pub fn to_token_value(&self) -> Result<Value> {
        let mut bag = self.clone();
        let mut intrinsics = Vec::new();
        for (_, dependency) in &mut bag.entries {
            for value in dependency.properties.values_mut() {
                take_intrinsics(value, &mut intrinsics);
            }
        }

        let text = bag.to_token()?;
        if intrinsics.is_empty() {
            return Ok(Value::String(text));
        }

        let mut markers = Vec::with_capacity(intrinsics.len());
        for index in 0..intrinsics.len() {
            let quoted = serde_json::to_string(&placeholder(index))?;
            let marker = &quoted[1..quoted.len() - 1];
            if let Some(position) = text.find(marker) {
                markers.push((position, marker.len(), index));
            }
        }
        markers.sort_unstable();

        let mut parts = Vec::with_capacity(markers.len() * 2 + 1);
        let mut cursor = 0;
        for (position, len, index) in markers {
            parts.push(Value::String(text[cursor..position].to_string()));
            parts.push(intrinsics[index].clone());
            cursor = position + len;
        }
        parts.push(Value::String(text[cursor..].to_string()));
        Ok(join(parts))
    }

    pub fn from_token(token: &str) -> Result<Self> {
        Ok(serde_json::from_str(token)?)
    }
}

fn placeholder(index: usize) -> String {
    format!("\u{0}{}\u{0}", index)
}

/// Swap every intrinsic under `value` for a placeholder string
fn take_intrinsics(value: &mut Value, found: &mut Vec<Value>) {
    if is_intrinsic(value) {
        let intrinsic = std::mem::replace(value, Value::String(placeholder(found.len())));
        found.push(intrinsic);
        return;
    }
    match value {
        Value::Array(items) => {
            for item in items {
                take_intrinsics(item, found);
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                take_intrinsics(item, found);
            }
        }
        _ => {}
    }
}

/// Scan a serialized bag for the first dependency of `kind` and return its properties
pub fn extract_by_type(token: &str, kind: &str) -> Result<Properties> {
    let bag = DependencyBag::from_token(token)?;
    bag.properties_of_type(kind).cloned()
}

struct Entries<'a>(&'a [(String, ResolvedDependency)]);

impl Serialize for Entries<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (token, dependency) in self.0 {
            map.serialize_entry(token, dependency)?;
        }
        map.end()
    }
}

impl Serialize for DependencyBag {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry("dependencies", &Entries(&self.entries))?;
        map.end()
    }
}

#[derive(Default)]
struct OrderedEntries(Vec<(String, ResolvedDependency)>);

impl<'de> Deserialize<'de> for OrderedEntries {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = OrderedEntries;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of dependency tokens")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut access: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut entries = Vec::new();
                while let Some((token, dependency)) =
                    access.next_entry::<String, ResolvedDependency>()?
                {
                    entries.push((token, dependency));
                }
                Ok(OrderedEntries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

impl<'de> Deserialize<'de> for DependencyBag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Wire {
            #[serde(default)]
            dependencies: OrderedEntries,
        }

        let wire = Wire::deserialize(deserializer)?;
        Ok(DependencyBag {
            entries: wire.dependencies.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixed(Properties);

    impl PropertySource for Fixed {
        fn properties(&self) -> Properties {
            self.0.clone()
        }
    }

    fn source(value: Value) -> Arc<dyn PropertySource> {
        match value {
            Value::Object(map) => Arc::new(Fixed(map)),
            _ => Arc::new(Fixed(Properties::new())),
        }
    }

    #[test]
    fn test_resolve_empty_spec() {
        let store = DependencyStore::new();
        assert!(store.resolve("").unwrap().is_empty());
        assert!(store.resolve("   ").unwrap().is_empty());
    }

    #[test]
    fn test_resolve_missing_resource() {
        let store = DependencyStore::new();
        let err = store.resolve("EFS:data").unwrap_err();
        assert!(matches!(&err, ForgeError::ResourceNotFound(token) if token == "EFS:data"));
        assert!(err.to_string().contains("resource not found"));
    }

    #[test]
    fn test_resolve_invalid_format() {
        let store = DependencyStore::new();
        for bad in ["bad-token", "EFS:", ":data", "A:B:C"] {
            let err = store.resolve(bad).unwrap_err();
            assert!(
                matches!(&err, ForgeError::InvalidDependencyFormat(token) if token == bad),
                "{bad}"
            );
        }
        assert!(
            store
                .resolve("bad-token")
                .unwrap_err()
                .to_string()
                .contains("invalid format")
        );
    }

    #[test]
    fn test_store_and_resolve() {
        let store = DependencyStore::new();
        store.store("STORE:s1", source(json!({ "mount": "/data" })));

        let bag = store.resolve("STORE:s1").unwrap();
        let token: Value = serde_json::from_str(&bag.to_token().unwrap()).unwrap();
        assert_eq!(token["dependencies"]["STORE:s1"]["properties"]["mount"], "/data");
        assert_eq!(token["dependencies"]["STORE:s1"]["type"], "STORE");
        assert_eq!(token["dependencies"]["STORE:s1"]["id"], "s1");
    }

    #[test]
    fn test_resolve_upper_cases_type_and_trims() {
        let store = DependencyStore::new();
        store.store("EFS:data", source(json!({ "mountPoint": "/data" })));
        store.store("RDS:db", source(json!({ "port": 3306 })));

        let bag = store.resolve(" efs:data , RDS:db ").unwrap();
        assert_eq!(bag.len(), 2);
        assert_eq!(
            bag.get("efs:data").unwrap().property_str("mountPoint").unwrap(),
            "/data"
        );
        assert!(bag.get("RDS:db").is_some());
    }

    #[test]
    fn test_store_overwrites() {
        let store = DependencyStore::new();
        store.store("EFS:data", source(json!({ "v": 1 })));
        store.store("EFS:data", source(json!({ "v": 2 })));
        assert_eq!(store.len(), 1);
        assert_eq!(store.properties("EFS:data").unwrap()["v"], 2);
    }

    #[test]
    fn test_extract_by_type_first_match_in_order() {
        let store = DependencyStore::new();
        store.store("EFS:b", source(json!({ "mountPoint": "/b" })));
        store.store("EFS:a", source(json!({ "mountPoint": "/a" })));

        let token = store.resolve("EFS:b,EFS:a").unwrap().to_token().unwrap();
        let properties = extract_by_type(&token, "EFS").unwrap();
        assert_eq!(properties["mountPoint"], "/b");

        let bag = DependencyBag::from_token(&token).unwrap();
        assert_eq!(bag.find("EFS", "a").unwrap().properties["mountPoint"], "/a");
    }

    #[test]
    fn test_token_value_keeps_references_resolvable() {
        let store = DependencyStore::new();
        store.store(
            "EFS:shared",
            source(json!({ "fileSystemId": { "Ref": "FileSystemShared" }, "mountPoint": "/mnt/shared" })),
        );

        let value = store.resolve("EFS:shared").unwrap().to_token_value().unwrap();
        let parts = value["Fn::Join"][1].as_array().unwrap();
        assert_eq!(value["Fn::Join"][0], "");
        assert_eq!(parts.len(), 3);
        assert!(parts[0].as_str().unwrap().ends_with(r#""fileSystemId":""#));
        assert_eq!(parts[1], json!({ "Ref": "FileSystemShared" }));
        assert!(parts[2].as_str().unwrap().starts_with('"'));
        assert!(parts[2].as_str().unwrap().contains("/mnt/shared"));

        // Substituting a physical id yields the token with a literal in its place.
        let rendered = format!(
            "{}fs-123{}",
            parts[0].as_str().unwrap(),
            parts[2].as_str().unwrap()
        );
        let properties = extract_by_type(&rendered, "EFS").unwrap();
        assert_eq!(properties["fileSystemId"], "fs-123");
    }

    #[test]
    fn test_token_value_of_literals_is_the_token() {
        let store = DependencyStore::new();
        store.store("STORE:s1", source(json!({ "mount": "/data" })));

        let bag = store.resolve("STORE:s1").unwrap();
        assert_eq!(bag.to_token_value().unwrap(), Value::String(bag.to_token().unwrap()));
        assert_eq!(
            DependencyBag::new().to_token_value().unwrap(),
            json!(r#"{"dependencies":{}}"#)
        );
    }

    #[test]
    fn test_token_value_nested_references() {
        let store = DependencyStore::new();
        store.store(
            "RDS:db",
            source(json!({
                "endpoint": { "Fn::GetAtt": ["DatabaseDb", "Endpoint.Address"] },
                "subnets": [{ "Ref": "SubnetA" }, { "Ref": "SubnetB" }]
            })),
        );

        let value = store.resolve("RDS:db").unwrap().to_token_value().unwrap();
        let intrinsics: Vec<&Value> = value["Fn::Join"][1]
            .as_array()
            .unwrap()
            .iter()
            .filter(|part| part.is_object())
            .collect();
        assert_eq!(
            intrinsics,
            vec![
                &json!({ "Fn::GetAtt": ["DatabaseDb", "Endpoint.Address"] }),
                &json!({ "Ref": "SubnetA" }),
                &json!({ "Ref": "SubnetB" }),
            ]
        );
    }

    #[test]
    fn test_extract_by_type_missing() {
        let err = extract_by_type(r#"{"dependencies":{}}"#, "EFS").unwrap_err();
        assert!(matches!(&err, ForgeError::DependencyTypeNotFound(kind) if kind == "EFS"));
        assert_eq!(err.to_string(), "EFS dependency not found");
        assert!(extract_by_type("not json", "EFS").is_err());
    }

    #[test]
    fn test_property_str_missing() {
        let dependency = ResolvedDependency {
            kind: "EFS".into(),
            id: "data".into(),
            properties: Properties::new(),
        };
        let err = dependency.property_str("mountPoint").unwrap_err();
        assert!(matches!(err, ForgeError::PropertyNotFound { .. }));
    }

    #[test]
    fn test_store_key() {
        assert_eq!(store_key("efs", "data", 1), "EFS:data");
        assert_eq!(store_key("ec2", "web.2", 3), "EC2:web");
        assert_eq!(store_key("ec2", "web.2", 1), "EC2:web.2");
        assert_eq!(original_id("node.v1"), "node.v1");
        assert_eq!(original_id("node.10"), "node");
    }
}
