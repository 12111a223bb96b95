use std::str::FromStr;

use mirra_core::{ChangeType, ListEnvelope};
use mirra_select::{suggestions_from, LabelSelector};
use mirra_store::Collection;
use serde_json::{json, Value};

fn pod(name: &str, labels: Value) -> Value {
    json!({"metadata": {"name": name, "namespace": "web", "labels": labels}})
}

fn collection() -> Collection {
    let list = json!({
        "kind": "PodList",
        "apiVersion": "v1",
        "metadata": {"resourceVersion": "10"},
        "items": [
            pod("api-0", json!({"app": "api", "tier": "backend"})),
            pod("api-1", json!({"app": "api", "tier": "backend", "canary": "true"})),
            pod("ui-0", json!({"app": "ui", "tier": "frontend"})),
            {"metadata": {"name": "bare"}},
        ],
    });
    Collection::from_list(ListEnvelope::from_value(list).expect("list"))
}

fn names(sel: &LabelSelector, coll: &Collection) -> Vec<String> {
    sel.select(coll.iter()).into_keys().collect()
}

#[test]
fn parsed_selector_filters_a_collection() {
    let coll = collection();
    let sel = LabelSelector::from_str("app=api,canary").expect("parse");
    assert_eq!(names(&sel, &coll), vec!["api-1"]);

    let sel = LabelSelector::from_str("tier notin (backend)").expect("parse");
    assert_eq!(names(&sel, &coll), vec!["bare", "ui-0"]);
}

#[test]
fn empty_selector_keeps_everything() {
    let coll = collection();
    assert_eq!(names(&LabelSelector::new(), &coll).len(), 4);
}

#[test]
fn filtered_view_follows_collection_updates() {
    let mut coll = collection();
    let sel = LabelSelector::from_str("tier in (frontend)").expect("parse");
    assert_eq!(names(&sel, &coll), vec!["ui-0"]);

    coll.update(pod("ui-1", json!({"tier": "frontend"})), ChangeType::Added);
    coll.update(pod("ui-0", json!({"tier": "frontend"})), ChangeType::Deleted);
    assert_eq!(names(&sel, &coll), vec!["ui-1"]);
}

#[test]
fn suggestions_cover_every_labelled_object() {
    let coll = collection();
    let s = suggestions_from(coll.iter());
    assert_eq!(s.get("app").map(|v| v.len()), Some(2));
    assert_eq!(s.get("tier").map(|v| v.iter().cloned().collect::<Vec<_>>()), Some(vec!["backend".to_string(), "frontend".to_string()]));
    assert!(!s.contains_key("name"));
}

#[test]
fn display_round_trips_through_parse() {
    let sel = LabelSelector::from_str("app in (api, ui),env!=prod").expect("parse");
    let again = LabelSelector::from_str(&sel.to_string()).expect("reparse");
    assert_eq!(sel, again);
}
