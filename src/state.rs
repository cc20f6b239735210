//! Action-scoped local state and prophecy values.
//!
//! `LocalState` is the minimal slice of system state one action needs: a map
//! from state-variable name to value, restricted to the action's declared
//! `touched_state_keys`. It is generated fresh per iteration and owned by
//! that iteration alone; there is no global system state anywhere in the
//! harness.
//!
//! `ProphecyValues` are chosen at generation time and predict which branch a
//! nondeterministic implementation path will take. They configure test
//! doubles and drive the model-side candidate selection; the implementation
//! under test must never observe them directly.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::btree_map;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{HarnessError, HarnessResult};

/// Minimal per-action state slice, keyed by state-variable name.
///
/// Invariant: contains no key outside the owning action's
/// `touched_state_keys`. Enforced at construction and on insert.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LocalState {
    entries: BTreeMap<String, Value>,
}

impl LocalState {
    /// Empty local state (legal: actions with no touched keys are checked
    /// for state-independent invariants only).
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a local state scoped to `allowed` keys, rejecting any entry
    /// outside the scope.
    pub fn scoped(
        allowed: &BTreeSet<String>,
        entries: BTreeMap<String, Value>,
    ) -> HarnessResult<Self> {
        for key in entries.keys() {
            if !allowed.contains(key) {
                return Err(HarnessError::hook(format!(
                    "state variable `{key}` is outside the action's touched keys"
                )));
            }
        }
        Ok(Self { entries })
    }

    /// Insert a value, enforcing the scoping invariant.
    pub fn insert_scoped(
        &mut self,
        allowed: &BTreeSet<String>,
        key: impl Into<String>,
        value: Value,
    ) -> HarnessResult<()> {
        let key = key.into();
        if !allowed.contains(&key) {
            return Err(HarnessError::hook(format!(
                "state variable `{key}` is outside the action's touched keys"
            )));
        }
        self.entries.insert(key, value);
        Ok(())
    }

    /// Look up a state variable.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Iterate entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter()
    }

    /// Number of state variables present.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when no state variable is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Key set, for scoping checks in tests.
    #[must_use]
    pub fn keys(&self) -> BTreeSet<String> {
        self.entries.keys().cloned().collect()
    }
}

impl<'a> IntoIterator for &'a LocalState {
    type Item = (&'a String, &'a Value);
    type IntoIter = btree_map::Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// One prophecy choice: either an index into the model's candidate set or a
/// named branch tag the model resolves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProphecyChoice {
    /// Zero-based index into the enumerated candidate set.
    Index(usize),
    /// Named branch tag matched against candidate tags.
    Branch(String),
}

impl core::fmt::Display for ProphecyChoice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Index(i) => write!(f, "index {i}"),
            Self::Branch(tag) => write!(f, "branch `{tag}`"),
        }
    }
}

/// Prophecy choices for one iteration, keyed by choice-point name.
///
/// Created alongside the local state, immutable afterwards, and recorded
/// literally in the witness so a failing case replays deterministically.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProphecyValues {
    choices: BTreeMap<String, ProphecyChoice>,
}

impl ProphecyValues {
    /// No prophecy choices (deterministic action).
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Record a choice for a named choice point.
    pub fn set(&mut self, name: impl Into<String>, choice: ProphecyChoice) {
        self.choices.insert(name.into(), choice);
    }

    /// Look up the choice for a choice point.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ProphecyChoice> {
        self.choices.get(name)
    }

    /// Convenience: the index chosen for a choice point, when it is an index.
    #[must_use]
    pub fn index(&self, name: &str) -> Option<usize> {
        match self.choices.get(name) {
            Some(ProphecyChoice::Index(i)) => Some(*i),
            _ => None,
        }
    }

    /// Returns `true` when no choice was generated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.choices.is_empty()
    }

    /// Iterate choices in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ProphecyChoice)> {
        self.choices.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn keys(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn scoped_accepts_subset() {
        let allowed = keys(&["counters", "clock"]);
        let mut entries = BTreeMap::new();
        entries.insert("counters".to_string(), json!([]));
        let state = LocalState::scoped(&allowed, entries).expect("in scope");
        assert_eq!(state.len(), 1);
        assert!(state.get("counters").is_some());
    }

    #[test]
    fn scoped_rejects_out_of_scope_key() {
        let allowed = keys(&["counters"]);
        let mut entries = BTreeMap::new();
        entries.insert("sessions".to_string(), json!({}));
        let err = LocalState::scoped(&allowed, entries).unwrap_err();
        assert!(err.to_string().contains("sessions"));
    }

    #[test]
    fn insert_scoped_enforces_invariant() {
        let allowed = keys(&["counters"]);
        let mut state = LocalState::empty();
        state
            .insert_scoped(&allowed, "counters", json!([{"name": "x", "value": 0}]))
            .expect("in scope");
        assert!(state.insert_scoped(&allowed, "clock", json!(0)).is_err());
    }

    #[test]
    fn empty_state_is_legal() {
        let state = LocalState::empty();
        assert!(state.is_empty());
        assert!(state.keys().is_empty());
    }

    #[test]
    fn prophecy_round_trips_through_json() {
        let mut prophecy = ProphecyValues::none();
        prophecy.set("read_visibility", ProphecyChoice::Index(1));
        prophecy.set("rpc_outcome", ProphecyChoice::Branch("timeout".to_string()));

        let encoded = serde_json::to_string(&prophecy).expect("encode");
        let decoded: ProphecyValues = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(prophecy, decoded);
        assert_eq!(decoded.index("read_visibility"), Some(1));
        assert_eq!(decoded.index("rpc_outcome"), None);
    }

    #[test]
    fn prophecy_display_names_choice() {
        assert_eq!(ProphecyChoice::Index(2).to_string(), "index 2");
        assert!(
            ProphecyChoice::Branch("late".to_string())
                .to_string()
                .contains("late")
        );
    }
}
