//! Mirra store: the per-key indexed collection and callback fan-out.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use mirra_core::{object_name, object_resource_version, ChangeType, ListEnvelope};
use serde_json::Value;
use tracing::debug;

mod registry;

pub use registry::{CallbackRegistry, SubscriptionId};

/// One slot of a secondary index from [`Collection::by`].
#[derive(Debug, Clone, PartialEq)]
pub enum IndexEntry {
    /// Scalar or array element at the path.
    Record(Value),
    /// Map key at the path: its values, each to the record carrying it.
    Values(BTreeMap<String, Value>),
}

impl IndexEntry {
    pub fn record(&self) -> Option<&Value> {
        match self {
            IndexEntry::Record(v) => Some(v),
            IndexEntry::Values(_) => None,
        }
    }

    /// Record carrying `value` under a map key.
    pub fn value(&self, value: &str) -> Option<&Value> {
        match self {
            IndexEntry::Values(vals) => vals.get(value),
            IndexEntry::Record(_) => None,
        }
    }
}

/// Current known set of objects for one resource key.
///
/// Only the primary name index is maintained incrementally; secondary indices
/// from [`Collection::by`] are recomputed on every call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Collection {
    kind: Option<String>,
    resource_version: Option<String>,
    by_name: BTreeMap<String, Value>,
    epoch: u64,
}

impl Collection {
    /// Build from a (normalized) list response.
    pub fn from_list(env: ListEnvelope) -> Self {
        let mut c = Self::default();
        c.replace(env);
        c
    }

    /// Replace all contents with a full list response. Never merges.
    pub fn replace(&mut self, env: ListEnvelope) {
        self.kind = env.item_kind().map(|k| k.to_string());
        self.resource_version = env.resource_version;
        self.by_name.clear();
        let mut skipped = 0usize;
        for item in env.items {
            match object_name(&item).map(|n| n.to_string()) {
                Some(name) => { self.by_name.insert(name, item); }
                None => skipped += 1,
            }
        }
        if skipped > 0 { debug!(skipped, "collection: list items without metadata.name ignored"); }
        self.epoch = self.epoch.saturating_add(1);
    }

    /// Apply one change. `Deleted` removes the record, anything else upserts it.
    /// Returns false when the record has no name and was ignored.
    pub fn update(&mut self, record: Value, change: ChangeType) -> bool {
        let Some(name) = object_name(&record).map(|n| n.to_string()) else {
            debug!(change = %change, "collection: change without metadata.name ignored");
            return false;
        };
        match change {
            ChangeType::Deleted => { self.by_name.remove(&name); }
            ChangeType::Added | ChangeType::Modified => {
                if let Some(rv) = object_resource_version(&record) {
                    self.resource_version = Some(rv.to_string());
                }
                self.by_name.insert(name, record);
            }
        }
        self.epoch = self.epoch.saturating_add(1);
        true
    }

    /// Index records by the value(s) found at a dotted `path`.
    ///
    /// Scalars map `value -> record`; an array fans out one entry per scalar
    /// element; a map fans out one level, `key -> value -> record`. Records
    /// where any path segment is missing are left out. Later names win on
    /// collisions.
    pub fn by(&self, path: &str) -> BTreeMap<String, IndexEntry> {
        if path == "metadata.name" {
            return self.by_name.iter().map(|(k, v)| (k.clone(), IndexEntry::Record(v.clone()))).collect();
        }
        let mut out = BTreeMap::new();
        for record in self.by_name.values() {
            let Some(found) = lookup(record, path) else { continue };
            match found {
                Value::Object(map) => {
                    for (k, v) in map {
                        let Some(val) = render_scalar(v) else { continue };
                        let entry = out.entry(k.clone()).or_insert_with(|| IndexEntry::Values(BTreeMap::new()));
                        if !matches!(entry, IndexEntry::Values(_)) { *entry = IndexEntry::Values(BTreeMap::new()); }
                        if let IndexEntry::Values(vals) = entry { vals.insert(val, record.clone()); }
                    }
                }
                Value::Array(vals) => {
                    for v in vals {
                        if let Some(k) = render_scalar(v) { out.insert(k, IndexEntry::Record(record.clone())); }
                    }
                }
                other => {
                    if let Some(k) = render_scalar(other) { out.insert(k, IndexEntry::Record(record.clone())); }
                }
            }
        }
        out
    }

    pub fn get(&self, name: &str) -> Option<&Value> { self.by_name.get(name) }
    pub fn contains(&self, name: &str) -> bool { self.by_name.contains_key(name) }
    pub fn len(&self) -> usize { self.by_name.len() }
    pub fn is_empty(&self) -> bool { self.by_name.is_empty() }
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> { self.by_name.iter() }
    pub fn names(&self) -> impl Iterator<Item = &str> { self.by_name.keys().map(|s| s.as_str()) }
    pub fn kind(&self) -> Option<&str> { self.kind.as_deref() }
    /// Bumped on every replace/update.
    pub fn epoch(&self) -> u64 { self.epoch }

    pub fn resource_version(&self) -> Option<&str> { self.resource_version.as_deref() }
    pub fn set_resource_version(&mut self, rv: Option<String>) { self.resource_version = rv; }
}

fn lookup<'a>(v: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = v;
    for seg in path.split('.') {
        cur = cur.as_object()?.get(seg)?;
    }
    if cur.is_null() { None } else { Some(cur) }
}

fn render_scalar(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod(name: &str, labels: Value) -> Value {
        json!({"kind": "Pod", "metadata": {"name": name, "labels": labels}, "spec": {"nodeName": format!("node-{}", name)}})
    }

    fn coll(items: Vec<Value>) -> Collection {
        Collection::from_list(ListEnvelope { kind: Some("PodList".into()), resource_version: Some("1".into()), items, ..Default::default() })
    }

    #[test]
    fn replace_is_not_a_merge() {
        let mut c = coll(vec![pod("a", json!({})), pod("b", json!({}))]);
        c.replace(ListEnvelope { kind: Some("PodList".into()), resource_version: Some("9".into()), items: vec![pod("c", json!({}))], ..Default::default() });
        assert_eq!(c.names().collect::<Vec<_>>(), vec!["c"]);
        assert_eq!(c.resource_version(), Some("9"));
        assert_eq!(c.kind(), Some("Pod"));
    }

    #[test]
    fn added_modified_deleted_leaves_no_record() {
        let mut c = coll(vec![]);
        assert!(c.update(pod("a", json!({"v": "1"})), ChangeType::Added));
        assert!(c.update(pod("a", json!({"v": "2"})), ChangeType::Modified));
        assert_eq!(c.get("a").expect("a")["metadata"]["labels"]["v"], "2");
        assert!(c.update(pod("a", json!({})), ChangeType::Deleted));
        assert!(!c.contains("a"));
        assert!(c.is_empty());
    }

    #[test]
    fn nameless_records_are_ignored() {
        let mut c = coll(vec![json!({"metadata": {}})]);
        assert!(c.is_empty());
        assert!(!c.update(json!({"kind": "Pod"}), ChangeType::Added));
    }

    #[test]
    fn by_scalar_path_and_missing_segments() {
        let c = coll(vec![pod("a", json!({})), json!({"metadata": {"name": "b"}})]);
        let idx = c.by("spec.nodeName");
        assert_eq!(idx.len(), 1);
        assert_eq!(idx["node-a"].record().expect("record")["metadata"]["name"], "a");
        assert!(c.by("spec.nodeName.deeper").is_empty());
        assert!(c.by("status.phase").is_empty());
    }

    #[test]
    fn by_map_fans_out_per_key() {
        let c = coll(vec![pod("a", json!({"app": "web", "tier": "fe"})), pod("b", json!({"db": "pg"}))]);
        let idx = c.by("metadata.labels");
        let keys: Vec<_> = idx.keys().cloned().collect();
        assert_eq!(keys, vec!["app", "db", "tier"]);
        assert_eq!(idx["db"].value("pg").expect("pg")["metadata"]["name"], "b");
        assert!(idx["db"].record().is_none());
    }

    #[test]
    fn by_map_keeps_every_value_of_a_shared_key() {
        let c = coll(vec![pod("web-1", json!({"app": "web"})), pod("db-1", json!({"app": "db"}))]);
        let idx = c.by("metadata.labels");
        assert_eq!(idx.len(), 1);
        assert_eq!(idx["app"].value("web").expect("web")["metadata"]["name"], "web-1");
        assert_eq!(idx["app"].value("db").expect("db")["metadata"]["name"], "db-1");
        assert!(idx["app"].value("cache").is_none());
    }

    #[test]
    fn by_name_is_primary_index() {
        let c = coll(vec![pod("a", json!({})), pod("b", json!({}))]);
        assert_eq!(c.by("metadata.name").len(), 2);
    }

    #[test]
    fn modified_event_advances_resource_version() {
        let mut c = coll(vec![]);
        c.update(json!({"metadata": {"name": "a", "resourceVersion": "15"}}), ChangeType::Modified);
        assert_eq!(c.resource_version(), Some("15"));
        let before = c.epoch();
        c.update(json!({"metadata": {"name": "a"}}), ChangeType::Deleted);
        assert_eq!(c.epoch(), before + 1);
    }
}
