//! Refinement mapping engine.
//!
//! A refinement mapping converts implementation-local state into
//! model-comparable state: `(&ImplState, &ProphecyValues) -> ModelState`.
//! Mappings receive read-only views, which enforces purity by convention.
//! The engine is a dispatch table keyed by action name; it does not (and
//! cannot) validate that a supplied mapping is mathematically correct —
//! the runner's assertions are exactly that check.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{HarnessError, HarnessResult};
use crate::state::ProphecyValues;

/// Refinement mapping callable. Deterministic given identical inputs; must
/// not mutate either state.
pub type MappingFn<I, M> = Arc<dyn Fn(&I, &ProphecyValues) -> HarnessResult<M> + Send + Sync>;

/// Dispatch table of refinement mappings, populated before the run and
/// read-only afterwards.
pub struct RefinementEngine<I, M> {
    mappings: BTreeMap<String, MappingFn<I, M>>,
}

impl<I, M> Default for RefinementEngine<I, M> {
    fn default() -> Self {
        Self {
            mappings: BTreeMap::new(),
        }
    }
}

impl<I, M> RefinementEngine<I, M> {
    /// Empty engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mapping for an action. Fails with
    /// [`HarnessError::DuplicateAction`] if one is already registered.
    pub fn register<F>(&mut self, action: impl Into<String>, mapping: F) -> HarnessResult<()>
    where
        F: Fn(&I, &ProphecyValues) -> HarnessResult<M> + Send + Sync + 'static,
    {
        let action = action.into();
        if self.mappings.contains_key(&action) {
            return Err(HarnessError::DuplicateAction { name: action });
        }
        self.mappings.insert(action, Arc::new(mapping));
        Ok(())
    }

    /// Apply the mapping registered for `action`. Fails with
    /// [`HarnessError::UnknownAction`] when none is registered.
    pub fn apply(&self, action: &str, impl_state: &I, prophecy: &ProphecyValues) -> HarnessResult<M> {
        let mapping = self
            .mappings
            .get(action)
            .ok_or_else(|| HarnessError::UnknownAction {
                name: action.to_string(),
            })?;
        mapping(impl_state, prophecy)
    }

    /// Returns `true` when a mapping is registered for `action`.
    #[must_use]
    pub fn contains(&self, action: &str) -> bool {
        self.mappings.contains_key(action)
    }

    /// Number of registered mappings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    /// Returns `true` when no mapping is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

impl<I, M> RefinementEngine<I, M>
where
    I: Clone + Into<M>,
{
    /// Identity-like mapping for the case where model and implementation
    /// state are declared convertible. A convenience, not a requirement.
    pub fn register_identity(&mut self, action: impl Into<String>) -> HarnessResult<()> {
        self.register(action, |impl_state: &I, _prophecy| {
            Ok(impl_state.clone().into())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ProphecyChoice;

    #[derive(Debug, Clone, PartialEq)]
    struct ImplCounters {
        // Implementation keeps a dirty flag the model does not know about.
        entries: Vec<(String, i64)>,
        dirty: bool,
    }

    type ModelCounters = Vec<(String, i64)>;

    #[test]
    fn apply_dispatches_by_action() {
        let mut engine: RefinementEngine<ImplCounters, ModelCounters> = RefinementEngine::new();
        engine
            .register("create_counter", |state, _prophecy| {
                let mut entries = state.entries.clone();
                entries.sort();
                Ok(entries)
            })
            .expect("register");

        let impl_state = ImplCounters {
            entries: vec![("x".to_string(), 0)],
            dirty: true,
        };
        let mapped = engine
            .apply("create_counter", &impl_state, &ProphecyValues::none())
            .expect("apply");
        assert_eq!(mapped, vec![("x".to_string(), 0)]);
    }

    #[test]
    fn unknown_mapping_is_rejected() {
        let engine: RefinementEngine<ImplCounters, ModelCounters> = RefinementEngine::new();
        let impl_state = ImplCounters {
            entries: vec![],
            dirty: false,
        };
        let err = engine
            .apply("missing", &impl_state, &ProphecyValues::none())
            .unwrap_err();
        assert_eq!(
            err,
            HarnessError::UnknownAction {
                name: "missing".to_string()
            }
        );
    }

    #[test]
    fn duplicate_mapping_is_rejected() {
        let mut engine: RefinementEngine<i64, i64> = RefinementEngine::new();
        engine.register("incr", |s, _| Ok(*s)).expect("first");
        let err = engine.register("incr", |s, _| Ok(*s)).unwrap_err();
        assert!(matches!(err, HarnessError::DuplicateAction { .. }));
    }

    #[test]
    fn identity_mapping_for_convertible_states() {
        let mut engine: RefinementEngine<i64, i64> = RefinementEngine::new();
        engine.register_identity("incr").expect("register");
        let mapped = engine.apply("incr", &7, &ProphecyValues::none()).expect("apply");
        assert_eq!(mapped, 7);
    }

    #[test]
    fn mapping_sees_prophecy_values() {
        // Prophecy selects which model outcome the mapped state must match,
        // e.g. a timed-out write maps to the pre-commit view.
        let mut engine: RefinementEngine<(i64, i64), i64> = RefinementEngine::new();
        engine
            .register("racy_read", |state: &(i64, i64), prophecy| {
                match prophecy.index("visibility") {
                    Some(0) => Ok(state.0),
                    Some(1) => Ok(state.1),
                    other => Err(HarnessError::hook(format!(
                        "unexpected visibility choice {other:?}"
                    ))),
                }
            })
            .expect("register");

        let mut prophecy = ProphecyValues::none();
        prophecy.set("visibility", ProphecyChoice::Index(1));
        let mapped = engine.apply("racy_read", &(5, 6), &prophecy).expect("apply");
        assert_eq!(mapped, 6);
    }
}
