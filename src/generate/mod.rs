//! Test-input generation scoped per action.
//!
//! Two strategies, selectable per action:
//!
//! - [`GenStrategy::Random`]: type-driven draws from the action's input
//!   schema, with optional custom per-field generators. See [`random`].
//! - [`GenStrategy::CategoryPartition`]: Cartesian product of named
//!   categories of choice functions, filtered by exclusion predicates. See
//!   [`partition`].
//!
//! Both strategies generate prophecy values alongside the local state, one
//! index per declared choice point, and both respect the scoping invariant:
//! a generated `LocalState` never contains a key outside the action's
//! `touched_state_keys`.

pub mod partition;
pub mod random;

use std::sync::Arc;

use crate::error::{HarnessError, HarnessResult};
use crate::registry::Action;
use crate::rng::{DetRng, label_hash};
use crate::state::{LocalState, ProphecyChoice, ProphecyValues};

pub use partition::{Category, Choice, ComboView, PartitionSpec};

/// Whole-state validity predicate; candidate states failing it are rejected
/// and regenerated (random strategy) up to the retry bound.
pub type ValidityFn = Arc<dyn Fn(&LocalState) -> bool + Send + Sync>;

/// Generation strategy for one action.
#[derive(Clone)]
pub enum GenStrategy {
    /// Type-driven random generation from the input schema.
    Random,
    /// Cartesian product of category choices.
    CategoryPartition(PartitionSpec),
}

impl core::fmt::Debug for GenStrategy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Random => write!(f, "Random"),
            Self::CategoryPartition(spec) => {
                write!(f, "CategoryPartition[{} categories]", spec.categories.len())
            }
        }
    }
}

/// Default bound on regenerate/reject attempts.
pub const DEFAULT_MAX_RETRIES: u32 = 64;

/// Per-action generator configuration.
#[derive(Clone)]
pub struct GenConfig {
    /// Strategy to use.
    pub strategy: GenStrategy,
    /// Bound on regenerate/reject attempts before
    /// [`HarnessError::UnsatisfiableConstraint`]. Must not loop forever.
    /// Random strategy only; the partition strategy enumerates a finite
    /// product and needs no retry budget.
    pub max_retries: u32,
    /// Optional whole-state validity predicate (random strategy only;
    /// partition choices build states directly).
    pub validity: Option<ValidityFn>,
}

impl GenConfig {
    /// Random strategy with defaults.
    #[must_use]
    pub fn random() -> Self {
        Self {
            strategy: GenStrategy::Random,
            max_retries: DEFAULT_MAX_RETRIES,
            validity: None,
        }
    }

    /// Category-partition strategy with defaults.
    #[must_use]
    pub fn category_partition(spec: PartitionSpec) -> Self {
        Self {
            strategy: GenStrategy::CategoryPartition(spec),
            max_retries: DEFAULT_MAX_RETRIES,
            validity: None,
        }
    }

    /// Override the retry bound.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Attach a validity predicate.
    #[must_use]
    pub fn with_validity<F>(mut self, validity: F) -> Self
    where
        F: Fn(&LocalState) -> bool + Send + Sync + 'static,
    {
        self.validity = Some(Arc::new(validity));
        self
    }
}

impl Default for GenConfig {
    fn default() -> Self {
        Self::random()
    }
}

impl core::fmt::Debug for GenConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GenConfig")
            .field("strategy", &self.strategy)
            .field("max_retries", &self.max_retries)
            .field("validity", &self.validity.is_some())
            .finish()
    }
}

/// One generated test case, ready for the runner.
#[derive(Debug, Clone)]
pub struct GeneratedCase {
    /// Zero-based iteration index within the action's plan.
    pub iteration: u64,
    /// Seed of the iteration's forked RNG stream (recorded in the witness).
    pub seed: u64,
    /// Generated local state.
    pub local_state: LocalState,
    /// Generated prophecy choices.
    pub prophecy: ProphecyValues,
    /// Category-partition combo labels, when that strategy produced the
    /// case (`category=choice` per category, in declared order).
    pub combo_labels: Option<Vec<String>>,
}

/// Plan the full set of cases for one action.
///
/// Random strategy emits `num_runs` cases, each from an independent RNG
/// stream forked from `(run_seed, action name, iteration)` so the plan is
/// identical at any worker count. Category-partition ignores `num_runs` and
/// emits one case per surviving combination.
pub fn plan(
    action: &Action,
    config: &GenConfig,
    run_seed: u64,
    num_runs: u64,
) -> HarnessResult<Vec<GeneratedCase>> {
    let base = DetRng::new(run_seed);
    let label = label_hash(&action.name);
    match &config.strategy {
        GenStrategy::Random => {
            let mut cases = Vec::with_capacity(num_runs as usize);
            for iteration in 0..num_runs {
                let mut rng = base.fork(label, iteration);
                let local_state = random::generate(action, config, &mut rng)?;
                let prophecy = draw_prophecy(action, &mut rng);
                cases.push(GeneratedCase {
                    iteration,
                    seed: case_seed(run_seed, label, iteration),
                    local_state,
                    prophecy,
                    combo_labels: None,
                });
            }
            Ok(cases)
        }
        GenStrategy::CategoryPartition(spec) => {
            let combos = partition::expand(action, spec)?;
            let mut cases = Vec::with_capacity(combos.len());
            for (iteration, combo) in combos.into_iter().enumerate() {
                let iteration = iteration as u64;
                let mut rng = base.fork(label, iteration);
                let prophecy = draw_prophecy(action, &mut rng);
                cases.push(GeneratedCase {
                    iteration,
                    seed: case_seed(run_seed, label, iteration),
                    local_state: combo.state,
                    prophecy,
                    combo_labels: Some(combo.labels),
                });
            }
            Ok(cases)
        }
    }
}

/// Draw one prophecy index per declared choice point.
fn draw_prophecy(action: &Action, rng: &mut DetRng) -> ProphecyValues {
    let mut prophecy = ProphecyValues::none();
    for spec in &action.prophecy {
        let index = rng.next_below(spec.cardinality as u64) as usize;
        prophecy.set(spec.name.clone(), ProphecyChoice::Index(index));
    }
    prophecy
}

/// Stable per-case seed recorded in witnesses.
fn case_seed(run_seed: u64, label: u64, iteration: u64) -> u64 {
    run_seed ^ label.rotate_left(17) ^ iteration.wrapping_mul(0x9e37_79b9_7f4a_7c15)
}

/// Check the retry budget, surfacing the unsatisfiable-constraint error.
pub(crate) fn retry_exhausted(action: &Action, attempts: u32) -> HarnessError {
    HarnessError::UnsatisfiableConstraint {
        action: action.name.clone(),
        attempts,
    }
}
