//! List response envelope and per-item normalization.

use serde_json::Value;

use crate::{CoreError, CoreResult};

/// Decoded `{ kind, resourceVersion | metadata.resourceVersion, items }` list response.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ListEnvelope {
    pub kind: Option<String>,
    pub api_version: Option<String>,
    pub resource_version: Option<String>,
    pub items: Vec<Value>,
}

impl ListEnvelope {
    pub fn from_value(v: Value) -> CoreResult<Self> {
        let Value::Object(mut root) = v else {
            return Err(CoreError::InvalidList("expected a JSON object".into()));
        };
        let kind = root.get("kind").and_then(|v| v.as_str()).map(|s| s.to_string());
        let api_version = root.get("apiVersion").and_then(|v| v.as_str()).map(|s| s.to_string());
        let resource_version = root
            .get("metadata")
            .and_then(|m| m.get("resourceVersion"))
            .or_else(|| root.get("resourceVersion"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        // Empty lists may serialize items as null.
        let items = match root.remove("items") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items,
            Some(_) => return Err(CoreError::InvalidList("items is not an array".into())),
        };
        Ok(Self { kind, api_version, resource_version, items })
    }

    /// Kind of the contained items: the envelope kind without its `List` suffix.
    pub fn item_kind(&self) -> Option<&str> {
        self.kind.as_deref().and_then(|k| k.strip_suffix("List")).filter(|k| !k.is_empty())
    }

    /// Backfill `kind` (and `apiVersion`) on items that omit them, as list
    /// responses do. Returns how many items received a kind.
    pub fn normalize(&mut self) -> usize {
        let item_kind = self.item_kind().map(|k| k.to_string());
        let api_version = self.api_version.clone();
        let mut filled = 0usize;
        for item in self.items.iter_mut() {
            let Some(obj) = item.as_object_mut() else { continue };
            if let Some(kind) = item_kind.as_deref() {
                if !obj.get("kind").map(|k| k.is_string()).unwrap_or(false) {
                    obj.insert("kind".to_string(), Value::String(kind.to_string()));
                    filled += 1;
                }
            }
            if let Some(av) = api_version.as_deref() {
                if !obj.contains_key("apiVersion") {
                    obj.insert("apiVersion".to_string(), Value::String(av.to_string()));
                }
            }
        }
        filled
    }
}
