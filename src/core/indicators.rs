// ============================================================================
// Indicator Maps
// ============================================================================
//
// Keyed diagnostic entries ("why this entity is not up", "what problems it
// has"). Maps are values: every change produces a new map which replaces the
// old one in a single publish. `im::OrdMap` gives O(1) clones with
// copy-on-write, so a map handed to one observer can never be changed under
// another observer's feet.
//
// Absent map != empty map: absent means nothing is monitoring, empty means
// monitored and clean.
//
// ============================================================================

use im::OrdMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndicatorMap(OrdMap<String, Value>);

impl IndicatorMap {
    pub fn new() -> Self {
        Self(OrdMap::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Builder-style insert, for constructing maps before they are published
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Mutates only this copy; published copies are unaffected
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove_entry(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for IndicatorMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl fmt::Display for IndicatorMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match value {
                Value::String(text) => write!(f, "{}: {}", key, text)?,
                other => write!(f, "{}: {}", key, other)?,
            }
        }
        write!(f, "}}")
    }
}

/// A requested change to one indicator entry.
///
/// `Remove` is the reserved removal marker; it is distinct from
/// `Set(Value::Null)`, which stores an explicit null.
#[derive(Debug, Clone, PartialEq)]
pub enum IndicatorUpdate {
    Set(Value),
    Remove,
}

impl From<Value> for IndicatorUpdate {
    fn from(value: Value) -> Self {
        IndicatorUpdate::Set(value)
    }
}

impl From<&str> for IndicatorUpdate {
    fn from(value: &str) -> Self {
        IndicatorUpdate::Set(Value::String(value.to_string()))
    }
}

impl From<String> for IndicatorUpdate {
    fn from(value: String) -> Self {
        IndicatorUpdate::Set(Value::String(value))
    }
}

/// Apply `update` to `key`, returning the map to publish or `None` if nothing changed.
///
/// An absent `current` map is materialized: the result is always `Some`, even
/// when the entry itself is unchanged (absent -> empty is a change).
pub fn upsert(current: Option<&IndicatorMap>, key: &str, update: IndicatorUpdate) -> Option<IndicatorMap> {
    let value = match update {
        IndicatorUpdate::Remove => return remove(current, key),
        IndicatorUpdate::Set(value) => value,
    };

    let created = current.is_none();
    let base = current.cloned().unwrap_or_default();

    let changed = match base.get(key) {
        None => true,
        Some(Value::Null) => !value.is_null(),
        Some(existing) => *existing != value,
    };

    if changed {
        let mut next = base;
        next.insert(key, value);
        Some(next)
    } else if created {
        Some(base)
    } else {
        None
    }
}

/// Remove `key`, returning the map to publish or `None` if nothing changed.
///
/// Like [`upsert`], an absent map is materialized as an empty one.
pub fn remove(current: Option<&IndicatorMap>, key: &str) -> Option<IndicatorMap> {
    match current {
        None => Some(IndicatorMap::new()),
        Some(map) if map.contains_key(key) => {
            let mut next = map.clone();
            next.remove_entry(key);
            Some(next)
        }
        Some(_) => None,
    }
}
