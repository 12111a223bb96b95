//! Mirra select: label selectors and collection filtering.
//!
//! A selector is an unordered set of conjuncts (`exists`, `in`, `not-in`)
//! that are AND-ed together. The empty selector matches everything.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use mirra_core::object_labels;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use smallvec::SmallVec;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    #[error("empty requirement in selector: {0}")]
    Empty(String),
    #[error("invalid requirement: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operator {
    Exists,
    In,
    NotIn,
}

/// One label predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conjunct {
    pub key: String,
    pub operator: Operator,
    pub values: SmallVec<[String; 2]>,
}

impl Conjunct {
    pub fn new<I, S>(key: &str, operator: Operator, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut values: SmallVec<[String; 2]> = values.into_iter().map(Into::into).collect();
        values.sort();
        values.dedup();
        Self { key: key.to_string(), operator, values }
    }

    pub fn exists(key: &str) -> Self { Self::new(key, Operator::Exists, Vec::<String>::new()) }

    /// Stable identity: the same predicate always yields the same id.
    pub fn id(&self) -> String {
        format!("{}|{:?}|{}", self.key, self.operator, self.values.join(","))
    }

    pub fn matches(&self, labels: &Map<String, Value>) -> bool {
        let value = labels.get(&self.key).and_then(label_str);
        match self.operator {
            Operator::Exists => value.map(|v| !v.is_empty()).unwrap_or(false),
            Operator::In => value.map(|v| self.values.iter().any(|x| x == v)).unwrap_or(false),
            // Absence of the key passes not-in.
            Operator::NotIn => value.map(|v| !self.values.iter().any(|x| x == v)).unwrap_or(true),
        }
    }
}

impl fmt::Display for Conjunct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operator {
            Operator::Exists => write!(f, "{}", self.key),
            Operator::In => write!(f, "{} in ({})", self.key, self.values.join(",")),
            Operator::NotIn => write!(f, "{} notin ({})", self.key, self.values.join(",")),
        }
    }
}

fn label_str(v: &Value) -> Option<&str> {
    v.as_str()
}

/// True when every conjunct matches `labels`.
pub fn matches(conjuncts: &[Conjunct], labels: &Map<String, Value>) -> bool {
    conjuncts.iter().all(|c| c.matches(labels))
}

/// Filter name -> record entries, preserving the original keys.
/// Records without a label map are matched against an empty one.
pub fn select<'a, I>(conjuncts: &[Conjunct], items: I) -> BTreeMap<String, Value>
where
    I: IntoIterator<Item = (&'a String, &'a Value)>,
{
    let empty = Map::new();
    items
        .into_iter()
        .filter(|(_, obj)| matches(conjuncts, object_labels(obj).unwrap_or(&empty)))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Distinct label values per key across a set of records (filter-bar suggestions).
pub fn suggestions_from<'a, I>(items: I) -> BTreeMap<String, BTreeSet<String>>
where
    I: IntoIterator<Item = (&'a String, &'a Value)>,
{
    let mut out: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (_, obj) in items {
        let Some(labels) = object_labels(obj) else { continue };
        for (k, v) in labels.iter() {
            if let Some(s) = label_str(v) {
                out.entry(k.clone()).or_default().insert(s.to_string());
            }
        }
    }
    out
}

/// Unordered, de-duplicated set of conjuncts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    conjuncts: BTreeMap<String, Conjunct>,
}

impl LabelSelector {
    pub fn new() -> Self { Self::default() }

    /// Equality selector (`key in [value]` per entry), as carried in
    /// service and deployment specs.
    pub fn from_labels(labels: &Map<String, Value>) -> Self {
        let mut sel = Self::new();
        for (k, v) in labels.iter() {
            if let Some(s) = label_str(v) { sel.add_conjunct(Conjunct::new(k, Operator::In, [s])); }
        }
        sel
    }

    pub fn add_conjunct(&mut self, c: Conjunct) -> String {
        let id = c.id();
        self.conjuncts.insert(id.clone(), c);
        id
    }

    pub fn remove_conjunct(&mut self, id: &str) -> Option<Conjunct> { self.conjuncts.remove(id) }
    pub fn clear(&mut self) { self.conjuncts.clear(); }
    pub fn is_empty(&self) -> bool { self.conjuncts.is_empty() }
    pub fn len(&self) -> usize { self.conjuncts.len() }
    pub fn conjuncts(&self) -> impl Iterator<Item = &Conjunct> { self.conjuncts.values() }

    fn as_vec(&self) -> Vec<Conjunct> { self.conjuncts.values().cloned().collect() }

    pub fn matches(&self, labels: &Map<String, Value>) -> bool {
        self.conjuncts.values().all(|c| c.matches(labels))
    }

    /// Match against an object's `metadata.labels`.
    pub fn matches_object(&self, obj: &Value) -> bool {
        let empty = Map::new();
        self.matches(object_labels(obj).unwrap_or(&empty))
    }

    pub fn select<'a, I>(&self, items: I) -> BTreeMap<String, Value>
    where
        I: IntoIterator<Item = (&'a String, &'a Value)>,
    {
        select(&self.as_vec(), items)
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.conjuncts.values().map(|c| c.to_string()).collect();
        f.write_str(&parts.join(","))
    }
}

/// Split on commas that are not inside a parenthesized value list.
fn split_requirements(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    for (i, ch) in s.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => { out.push(&s[start..i]); start = i + 1; }
            _ => {}
        }
    }
    out.push(&s[start..]);
    out
}

fn parse_set(rest: &str, whole: &str) -> Result<Vec<String>, SelectorError> {
    let inner = rest
        .trim()
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .ok_or_else(|| SelectorError::Invalid(whole.to_string()))?;
    let vals: Vec<String> = inner.split(',').map(|v| v.trim().to_string()).filter(|v| !v.is_empty()).collect();
    if vals.is_empty() { return Err(SelectorError::Invalid(whole.to_string())); }
    Ok(vals)
}

fn parse_requirement(req: &str) -> Result<Conjunct, SelectorError> {
    let r = req.trim();
    if r.is_empty() { return Err(SelectorError::Empty(req.to_string())); }
    if let Some((k, v)) = r.split_once("!=") {
        return Ok(Conjunct::new(k.trim(), Operator::NotIn, [v.trim()]));
    }
    if let Some((k, v)) = r.split_once("==").or_else(|| r.split_once('=')) {
        let (k, v) = (k.trim(), v.trim());
        if k.is_empty() || v.is_empty() { return Err(SelectorError::Invalid(r.to_string())); }
        return Ok(Conjunct::new(k, Operator::In, [v]));
    }
    let mut words = r.splitn(2, char::is_whitespace);
    let key = words.next().unwrap_or_default();
    if key.starts_with('!') { return Err(SelectorError::Invalid(r.to_string())); }
    match words.next().map(str::trim_start) {
        None => Ok(Conjunct::exists(key)),
        Some(rest) => {
            if let Some(set) = rest.strip_prefix("notin") {
                Ok(Conjunct::new(key, Operator::NotIn, parse_set(set, r)?))
            } else if let Some(set) = rest.strip_prefix("in") {
                Ok(Conjunct::new(key, Operator::In, parse_set(set, r)?))
            } else {
                Err(SelectorError::Invalid(r.to_string()))
            }
        }
    }
}

impl FromStr for LabelSelector {
    type Err = SelectorError;

    /// Accepts `k=v`, `k!=v`, `k in (a,b)`, `k notin (a,b)` and bare `k`.
    fn from_str(s: &str) -> Result<Self, SelectorError> {
        let mut sel = Self::new();
        if s.trim().is_empty() { return Ok(sel); }
        for req in split_requirements(s) {
            sel.add_conjunct(parse_requirement(req)?);
        }
        Ok(sel)
    }
}
