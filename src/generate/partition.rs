//! Category-partition generation.
//!
//! The input domain is partitioned into named categories, each a finite
//! list of choice functions that mutate a partially built local state. The
//! generator walks the Cartesian product of all categories and emits one
//! case per combination that survives the exclusion predicates.
//!
//! Product size is the product of category cardinalities; keeping that
//! tractable is the caller's job (via exclusion predicates), not the
//! engine's. Exclusion predicates are evaluated as a conjunction: a
//! combination is dropped once no matter how many predicates reject it, and
//! the result is independent of predicate evaluation order.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::Value;

use crate::error::HarnessResult;
use crate::registry::Action;
use crate::state::LocalState;

use super::retry_exhausted;

/// Mutable view handed to choice functions: scoped insert access to the
/// partially built local state.
pub struct PartialState {
    state: LocalState,
    allowed: BTreeSet<String>,
}

impl PartialState {
    fn new(allowed: BTreeSet<String>) -> Self {
        Self {
            state: LocalState::empty(),
            allowed,
        }
    }

    /// Set a state variable. Fails if the key is outside the action's
    /// touched state keys.
    pub fn set(&mut self, key: impl Into<String>, value: Value) -> HarnessResult<()> {
        self.state.insert_scoped(&self.allowed, key, value)
    }

    /// Read back a variable set by an earlier category's choice.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.state.get(key)
    }
}

/// Choice function: mutates the partially built state for its category.
pub type ChoiceFn = Arc<dyn Fn(&mut PartialState) -> HarnessResult<()> + Send + Sync>;

/// One choice within a category.
#[derive(Clone)]
pub struct Choice {
    /// Label recorded in the witness (`category=label`).
    pub label: String,
    apply: ChoiceFn,
}

impl Choice {
    /// Build a labeled choice.
    pub fn new<F>(label: impl Into<String>, apply: F) -> Self
    where
        F: Fn(&mut PartialState) -> HarnessResult<()> + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            apply: Arc::new(apply),
        }
    }
}

impl core::fmt::Debug for Choice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Choice({})", self.label)
    }
}

/// A named category: a finite list of equivalent choices.
#[derive(Debug, Clone)]
pub struct Category {
    /// Category name.
    pub name: String,
    /// The choices, in declared order.
    pub choices: Vec<Choice>,
}

impl Category {
    /// Build a category from its choices.
    #[must_use]
    pub fn new(name: impl Into<String>, choices: Vec<Choice>) -> Self {
        Self {
            name: name.into(),
            choices,
        }
    }
}

/// Read-only view of a fully built combination, for exclusion predicates.
pub struct ComboView<'a> {
    labels: &'a BTreeMap<String, String>,
    state: &'a LocalState,
}

impl ComboView<'_> {
    /// Label chosen for a category in this combination.
    #[must_use]
    pub fn label(&self, category: &str) -> Option<&str> {
        self.labels.get(category).map(String::as_str)
    }

    /// The built local state.
    #[must_use]
    pub fn state(&self) -> &LocalState {
        self.state
    }
}

/// Exclusion predicate: returns `true` to drop a combination.
pub type ExclusionFn = Arc<dyn Fn(&ComboView<'_>) -> bool + Send + Sync>;

/// Category-partition specification for one action.
#[derive(Clone, Default)]
pub struct PartitionSpec {
    /// Categories in declared order; the product iterates the last category
    /// fastest.
    pub categories: Vec<Category>,
    exclusions: Vec<ExclusionFn>,
}

impl PartitionSpec {
    /// Empty specification.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a category.
    #[must_use]
    pub fn category(mut self, category: Category) -> Self {
        self.categories.push(category);
        self
    }

    /// Append an exclusion predicate.
    #[must_use]
    pub fn exclude<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ComboView<'_>) -> bool + Send + Sync + 'static,
    {
        self.exclusions.push(Arc::new(predicate));
        self
    }

    /// Total product size before exclusions.
    #[must_use]
    pub fn product_size(&self) -> usize {
        self.categories.iter().map(|c| c.choices.len()).product()
    }
}

impl core::fmt::Debug for PartitionSpec {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PartitionSpec")
            .field("categories", &self.categories)
            .field("exclusions", &self.exclusions.len())
            .finish()
    }
}

/// A surviving combination.
#[derive(Debug, Clone)]
pub struct Combo {
    /// `category=label` per category, in declared order.
    pub labels: Vec<String>,
    /// The fully built local state.
    pub state: LocalState,
}

/// Expand the Cartesian product, applying choices in category order and
/// dropping excluded combinations. Fails with `UnsatisfiableConstraint`
/// when the exclusion predicates reject every combination (or the product
/// is empty).
pub fn expand(action: &Action, spec: &PartitionSpec) -> HarnessResult<Vec<Combo>> {
    let total = spec.product_size();
    let mut combos = Vec::new();
    let mut indices = vec![0usize; spec.categories.len()];
    let mut attempts = 0u32;

    for _ in 0..total {
        attempts = attempts.saturating_add(1);

        let mut partial = PartialState::new(action.touched_state_keys.clone());
        let mut label_map = BTreeMap::new();
        let mut labels = Vec::with_capacity(spec.categories.len());
        for (category, &index) in spec.categories.iter().zip(&indices) {
            let choice = &category.choices[index];
            (choice.apply)(&mut partial)?;
            label_map.insert(category.name.clone(), choice.label.clone());
            labels.push(format!("{}={}", category.name, choice.label));
        }

        let view = ComboView {
            labels: &label_map,
            state: &partial.state,
        };
        // Conjunction: any predicate rejecting drops the combo exactly once.
        let excluded = spec.exclusions.iter().any(|pred| pred(&view));
        if !excluded {
            combos.push(Combo {
                labels,
                state: partial.state,
            });
        }

        advance(&mut indices, &spec.categories);
    }

    if combos.is_empty() {
        return Err(retry_exhausted(action, attempts));
    }
    Ok(combos)
}

/// Odometer increment over category cardinalities, last category fastest.
fn advance(indices: &mut [usize], categories: &[Category]) {
    for pos in (0..indices.len()).rev() {
        indices[pos] += 1;
        if indices[pos] < categories[pos].choices.len() {
            return;
        }
        indices[pos] = 0;
    }
}
