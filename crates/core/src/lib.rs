//! Mirra core types: resource keys, change events and list envelopes.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

mod envelope;

pub use envelope::ListEnvelope;

/// Errors produced while resolving keys or decoding server payloads.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("invalid resource: {0} (expect plural, v1/plural or group/v1/plural)")]
    InvalidResource(String),
    #[error("invalid list response: {0}")]
    InvalidList(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

/// A served resource collection, addressed by its plural name (e.g. `pods`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceType {
    /// Empty for the core group.
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl ResourceType {
    pub fn new(group: &str, version: &str, resource: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), resource: resource.to_ascii_lowercase() }
    }

    /// Core-group shorthand: `ResourceType::core("pods")` is `v1/pods`.
    pub fn core(resource: &str) -> Self { Self::new("", "v1", resource) }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }
}

impl FromStr for ResourceType {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        let valid = |p: &&str| !p.is_empty() && !p.contains(char::is_whitespace);
        if !parts.iter().all(valid) {
            return Err(CoreError::InvalidResource(s.to_string()));
        }
        match parts.as_slice() {
            [resource] => Ok(Self::core(resource)),
            [version, resource] => Ok(Self::new("", version, resource)),
            [group, version, resource] => Ok(Self::new(group, version, resource)),
            _ => Err(CoreError::InvalidResource(s.to_string())),
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version(), self.resource)
    }
}

/// Unit of deduplication and caching: one resource type scoped to an optional namespace.
///
/// Two requests for the same type and namespace always resolve to equal keys,
/// and the `Display` form is stable (`apps/v1/deployments@web`, `v1/nodes`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    resource: ResourceType,
    namespace: Option<String>,
}

impl ResourceKey {
    /// An empty namespace is the same as no namespace.
    pub fn new(resource: ResourceType, namespace: Option<&str>) -> Self {
        let namespace = namespace.filter(|ns| !ns.is_empty()).map(|ns| ns.to_string());
        Self { resource, namespace }
    }

    /// Parse the resource part and scope it to `namespace`.
    pub fn parse(resource: &str, namespace: Option<&str>) -> CoreResult<Self> {
        Ok(Self::new(resource.parse()?, namespace))
    }

    pub fn resource(&self) -> &ResourceType { &self.resource }
    pub fn namespace(&self) -> Option<&str> { self.namespace.as_deref() }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}@{}", self.resource, ns),
            None => write!(f, "{}", self.resource),
        }
    }
}

/// Kind of incremental change carried by a watch frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Added => "ADDED",
            ChangeType::Modified => "MODIFIED",
            ChangeType::Deleted => "DELETED",
        }
    }
}

impl FromStr for ChangeType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "ADDED" => Ok(ChangeType::Added),
            "MODIFIED" => Ok(ChangeType::Modified),
            "DELETED" => Ok(ChangeType::Deleted),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// One applied change: the change type and the object as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    #[serde(rename = "type")]
    pub kind: ChangeType,
    pub object: Value,
}

// ---- object accessors (schema-agnostic) ----

pub fn object_name(obj: &Value) -> Option<&str> {
    obj.get("metadata").and_then(|m| m.get("name")).and_then(|v| v.as_str())
}

pub fn object_labels(obj: &Value) -> Option<&serde_json::Map<String, Value>> {
    obj.get("metadata").and_then(|m| m.get("labels")).and_then(|v| v.as_object())
}

pub fn object_resource_version(obj: &Value) -> Option<&str> {
    obj.get("metadata")
        .and_then(|m| m.get("resourceVersion"))
        .or_else(|| obj.get("resourceVersion"))
        .and_then(|v| v.as_str())
}

pub fn object_deletion_timestamp(obj: &Value) -> Option<&str> {
    obj.get("metadata").and_then(|m| m.get("deletionTimestamp")).and_then(|v| v.as_str())
}

/// Set `metadata.deletionTimestamp` unless present. Returns whether it was stamped.
pub fn stamp_deletion(obj: &mut Value, now_rfc3339: &str) -> bool {
    if object_deletion_timestamp(obj).is_some() { return false; }
    let Some(root) = obj.as_object_mut() else { return false; };
    let meta = root.entry("metadata").or_insert_with(|| Value::Object(Default::default()));
    match meta.as_object_mut() {
        Some(m) => {
            m.insert("deletionTimestamp".to_string(), Value::String(now_rfc3339.to_string()));
            true
        }
        None => false,
    }
}

pub mod prelude {
    pub use super::{Change, ChangeType, CoreError, ListEnvelope, ResourceKey, ResourceType};
}
