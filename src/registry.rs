//! Action registry: the catalog of named atomic state transitions.
//!
//! Actions are declared once, before any iteration runs, and are immutable
//! afterwards. The registry is read-mostly by construction: populate it in
//! an initialization phase, then share it freely across workers without
//! locking.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::Value;

use crate::error::{HarnessError, HarnessResult};
use crate::rng::DetRng;

/// Read/write classification of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Observes state without mutating it.
    Read,
    /// Mutates state. Write actions are subject to the stutter guard: a
    /// committed write must never be matched solely by a no-op candidate.
    Write,
}

/// Custom per-field generator closure.
pub type FieldGenerator = Arc<dyn Fn(&mut DetRng) -> Value + Send + Sync>;

/// Type-driven default generation for a field.
#[derive(Clone)]
pub enum FieldKind {
    /// Boolean.
    Bool,
    /// Bounded integer, inclusive range.
    Int {
        /// Lower bound.
        min: i64,
        /// Upper bound.
        max: i64,
    },
    /// Lowercase ASCII text with a length bound (termination guarantee).
    Text {
        /// Maximum length in bytes.
        max_len: usize,
    },
    /// Bounded array of a single element kind.
    Array {
        /// Element kind.
        elem: Box<FieldKind>,
        /// Maximum element count.
        max_len: usize,
        /// Enforce element uniqueness by regenerate-on-collision.
        unique: bool,
    },
    /// One value drawn from a fixed set.
    OneOf(
        /// The candidate values.
        Vec<Value>,
    ),
}

impl core::fmt::Debug for FieldKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Bool => write!(f, "Bool"),
            Self::Int { min, max } => write!(f, "Int[{min}..={max}]"),
            Self::Text { max_len } => write!(f, "Text[..{max_len}]"),
            Self::Array {
                elem,
                max_len,
                unique,
            } => write!(f, "Array[{elem:?}; ..{max_len}; unique={unique}]"),
            Self::OneOf(values) => write!(f, "OneOf[{}]", values.len()),
        }
    }
}

/// One field of an action's input schema.
#[derive(Clone)]
pub struct FieldSpec {
    /// State-variable name the field populates. Must be one of the action's
    /// touched state keys.
    pub name: String,
    /// Type-driven default generator.
    pub kind: FieldKind,
    /// Optional custom generator overriding the type-driven default (e.g. to
    /// keep emails well-formed).
    pub generator: Option<FieldGenerator>,
}

impl FieldSpec {
    /// Field with a type-driven default generator.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            generator: None,
        }
    }

    /// Attach a custom generator for this field.
    #[must_use]
    pub fn with_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn(&mut DetRng) -> Value + Send + Sync + 'static,
    {
        self.generator = Some(Arc::new(generator));
        self
    }
}

impl core::fmt::Debug for FieldSpec {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FieldSpec")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("custom", &self.generator.is_some())
            .finish()
    }
}

/// Declared nondeterministic choice point of an action.
///
/// The generator draws one index in `0..cardinality` per choice point; the
/// model adapter must enumerate exactly `cardinality` candidates for the
/// same choice point, or selection fails with `ProphecyOutOfRange`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProphecySpec {
    /// Choice-point name (e.g. `read_visibility`).
    pub name: String,
    /// Number of branches the model enumerates for this choice point.
    pub cardinality: usize,
}

impl ProphecySpec {
    /// Declare a choice point.
    #[must_use]
    pub fn new(name: impl Into<String>, cardinality: usize) -> Self {
        Self {
            name: name.into(),
            cardinality,
        }
    }
}

/// A named, atomic state transition exposed identically by the model and
/// the implementation under test.
#[derive(Debug, Clone)]
pub struct Action {
    /// Unique action name.
    pub name: String,
    /// Read/write classification.
    pub kind: ActionKind,
    /// Typed input schema driving generation.
    pub input_schema: Vec<FieldSpec>,
    /// State variables this action reads or writes. Integrator-declared;
    /// scopes local-state generation. Empty is legal.
    pub touched_state_keys: BTreeSet<String>,
    /// Whether the model may return a candidate *set* for this action.
    pub nondet: bool,
    /// Declared choice points. Non-empty only for nondeterministic actions
    /// validated in prophecy-narrowed mode; empty means exploratory
    /// set-membership checking.
    pub prophecy: Vec<ProphecySpec>,
}

impl Action {
    /// Start building an action declaration.
    #[must_use]
    pub fn builder(name: impl Into<String>, kind: ActionKind) -> ActionBuilder {
        ActionBuilder {
            action: Self {
                name: name.into(),
                kind,
                input_schema: Vec::new(),
                touched_state_keys: BTreeSet::new(),
                nondet: false,
                prophecy: Vec::new(),
            },
        }
    }
}

/// Builder for [`Action`] declarations.
#[derive(Debug)]
pub struct ActionBuilder {
    action: Action,
}

impl ActionBuilder {
    /// Declare a touched state key.
    #[must_use]
    pub fn touches(mut self, key: impl Into<String>) -> Self {
        self.action.touched_state_keys.insert(key.into());
        self
    }

    /// Add an input field. The field name is implicitly a touched key.
    #[must_use]
    pub fn field(mut self, field: FieldSpec) -> Self {
        self.action.touched_state_keys.insert(field.name.clone());
        self.action.input_schema.push(field);
        self
    }

    /// Mark the action nondeterministic.
    #[must_use]
    pub fn nondet(mut self) -> Self {
        self.action.nondet = true;
        self
    }

    /// Declare a prophecy choice point (implies nondeterminism).
    #[must_use]
    pub fn choice_point(mut self, spec: ProphecySpec) -> Self {
        self.action.nondet = true;
        self.action.prophecy.push(spec);
        self
    }

    /// Finish the declaration.
    #[must_use]
    pub fn build(self) -> Action {
        self.action
    }
}

/// Catalog of registered actions, keyed by name.
#[derive(Debug, Default)]
pub struct ActionRegistry {
    actions: BTreeMap<String, Arc<Action>>,
}

impl ActionRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action. Fails with [`HarnessError::DuplicateAction`] if
    /// the name is taken.
    pub fn register(&mut self, action: Action) -> HarnessResult<()> {
        if self.actions.contains_key(&action.name) {
            return Err(HarnessError::DuplicateAction { name: action.name });
        }
        self.actions.insert(action.name.clone(), Arc::new(action));
        Ok(())
    }

    /// Resolve an action by name. Fails with
    /// [`HarnessError::UnknownAction`] if absent.
    pub fn resolve(&self, name: &str) -> HarnessResult<Arc<Action>> {
        self.actions
            .get(name)
            .cloned()
            .ok_or_else(|| HarnessError::UnknownAction {
                name: name.to_string(),
            })
    }

    /// All registered actions in name order.
    pub fn actions(&self) -> impl Iterator<Item = &Arc<Action>> {
        self.actions.values()
    }

    /// Number of registered actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Returns `true` when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}
