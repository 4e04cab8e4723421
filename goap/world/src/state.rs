use std::fmt;

use im::OrdMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::value::StateValue;

/// Persistent sorted map backing a [`WorldState`].
pub type Facts = OrdMap<String, StateValue>;

/// Immutable snapshot mapping dotted state keys to facts.
///
/// Facts live in a persistent B-tree: cloning a state is O(1) and a
/// derivation copies only the nodes on the path to each changed key, so a
/// search child shares every untouched entry with its parent.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorldState {
    facts: Facts,
}

impl fmt::Debug for WorldState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.facts.iter()).finish()
    }
}

impl WorldState {
    /// Empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a state from `(key, value)` pairs.
    pub fn from_facts<K, V>(facts: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<StateValue>,
    {
        Self {
            facts: facts
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }

    /// Flattens a JSON document into dotted keys (`{"coverage": {"line": 40}}`
    /// becomes `coverage.line = 40`). Nulls are skipped.
    #[must_use]
    pub fn from_json(document: &serde_json::Value) -> Self {
        let mut facts = Facts::new();
        flatten_into(&mut facts, None, document);
        Self { facts }
    }

    /// Returns a state with `key` set, consuming `self`.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<StateValue>) -> Self {
        self.facts.insert(key.into(), value.into());
        self
    }

    /// Derives a new state with `key` set; `self` is untouched.
    #[must_use]
    pub fn set(&self, key: impl Into<String>, value: impl Into<StateValue>) -> Self {
        self.clone().with(key, value)
    }

    /// Derives a new state by running `edit` over a structural copy of the
    /// facts. When `edit` reports no change the original storage is shared.
    #[must_use]
    pub fn derive<F>(&self, edit: F) -> Self
    where
        F: FnOnce(&mut Facts) -> bool,
    {
        let mut facts = self.facts.clone();
        if edit(&mut facts) {
            Self { facts }
        } else {
            self.clone()
        }
    }

    /// Derives a new state where every fact of `overlay` replaces ours.
    #[must_use]
    pub fn overlay(&self, overlay: &Self) -> Self {
        if overlay.is_empty() {
            return self.clone();
        }
        self.derive(|facts| {
            let mut changed = false;
            for (key, value) in overlay.iter() {
                if facts.get(key) != Some(value) {
                    facts.insert(key.clone(), value.clone());
                    changed = true;
                }
            }
            changed
        })
    }

    /// Looks up a fact.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&StateValue> {
        self.facts.get(key)
    }

    /// Numeric fact, if present and numeric.
    #[must_use]
    pub fn number(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(StateValue::as_f64)
    }

    /// Flag fact; missing or non-boolean facts read as `false`.
    #[must_use]
    pub fn flag(&self, key: &str) -> bool {
        self.get(key).and_then(StateValue::as_bool).unwrap_or(false)
    }

    /// Whether the key is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.facts.contains_key(key)
    }

    /// Number of facts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.facts.len()
    }

    /// Whether the state holds no facts.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    /// Facts in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &StateValue)> {
        self.facts.iter()
    }

    /// Keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.facts.keys().map(String::as_str)
    }

    /// Whether both snapshots share the same storage.
    #[must_use]
    pub fn shares_storage_with(&self, other: &Self) -> bool {
        self.facts.ptr_eq(&other.facts)
    }

    /// Canonical text form: sorted `key=value;` pairs with normalized numbers.
    #[must_use]
    pub fn canonical_encoding(&self) -> String {
        let mut out = String::with_capacity(self.facts.len() * 24);
        for (key, value) in self.facts.iter() {
            out.push_str(key);
            out.push('=');
            value.encode_canonical(&mut out);
            out.push(';');
        }
        out
    }

    /// Stable SHA-256 hex digest of the canonical encoding.
    #[must_use]
    pub fn canonical_hash(&self) -> String {
        hex::encode(Sha256::digest(self.canonical_encoding().as_bytes()))
    }

    /// JSON object of the flat facts.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Free-function form of [`WorldState::canonical_hash`].
#[must_use]
pub fn canonical_hash(state: &WorldState) -> String {
    state.canonical_hash()
}

fn flatten_into(facts: &mut Facts, prefix: Option<&str>, value: &serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, nested) in map {
                let path = prefix.map_or_else(|| key.clone(), |prefix| format!("{prefix}.{key}"));
                flatten_into(facts, Some(&path), nested);
            }
        }
        other => {
            if let (Some(key), Some(value)) = (prefix, StateValue::from_json(other)) {
                facts.insert(key.to_string(), value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn derivations_never_touch_the_source() {
        let base = WorldState::new().with("coverage.line", 40);
        let next = base.set("coverage.line", 55);
        assert_eq!(base.number("coverage.line"), Some(40.0));
        assert_eq!(next.number("coverage.line"), Some(55.0));
        assert!(!base.shares_storage_with(&next));
    }

    #[test]
    fn unchanged_derivation_shares_storage() {
        let base = WorldState::new().with("testsMeasured", true);
        let same = base.derive(|_| false);
        assert!(base.shares_storage_with(&same));
        let overlaid = base.overlay(&WorldState::new().with("testsMeasured", true));
        assert!(base.shares_storage_with(&overlaid));
    }

    #[test]
    fn large_states_derive_without_disturbing_siblings() {
        let base = WorldState::from_facts((0..512).map(|i| (format!("metric.{i:03}"), i)));
        let left = base.set("metric.007", -1);
        let right = base.set("metric.400", -1);
        assert_eq!(base.number("metric.007"), Some(7.0));
        assert_eq!(left.number("metric.400"), Some(400.0));
        assert_eq!(right.number("metric.007"), Some(7.0));
        assert_eq!(left.len(), 512);
        assert!(!left.shares_storage_with(&right));
        assert_ne!(left.canonical_hash(), right.canonical_hash());
    }

    #[test]
    fn canonical_hash_ignores_insertion_order_and_float_noise() {
        let a = WorldState::new().with("a", 1).with("b", 0.1 + 0.2);
        let b = WorldState::new().with("b", 0.3).with("a", 1);
        assert_eq!(a.canonical_hash(), b.canonical_hash());
        let c = b.set("a", 2);
        assert_ne!(a.canonical_hash(), c.canonical_hash());
    }

    #[test]
    fn hash_distinguishes_kinds() {
        let text = WorldState::new().with("k", "true");
        let flag = WorldState::new().with("k", true);
        assert_ne!(text.canonical_hash(), flag.canonical_hash());
    }

    #[test]
    fn flattens_nested_json() {
        let state = WorldState::from_json(&json!({
            "coverage": { "line": 40, "branch": null },
            "testsMeasured": false,
            "suites": ["unit"]
        }));
        assert_eq!(state.number("coverage.line"), Some(40.0));
        assert!(!state.contains_key("coverage.branch"));
        assert!(!state.flag("testsMeasured"));
        assert_eq!(state.len(), 3);
    }

    #[test]
    fn serializes_as_flat_object() {
        let state = WorldState::new().with("coverage.line", 40);
        assert_eq!(state.to_json(), json!({ "coverage.line": 40.0 }));
        let back: WorldState = serde_json::from_value(state.to_json()).unwrap();
        assert_eq!(back, state);
    }
}
