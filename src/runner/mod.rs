//! Conformance runner: the per-iteration state machine and the run loop.
//!
//! One iteration moves through `Generated -> ImplSetup -> ModelSetup ->
//! Executed -> Mapped -> Asserted -> TornDown` in strict sequence and ends
//! `Passed`, `Failed`, or `Errored`. Teardown runs on every exit path that
//! acquired resources, including assertion failure and hook panic, so a
//! long property-test session cannot leak connections or transactions
//! across iterations.
//!
//! Iterations are logically independent: each owns its local state,
//! prophecy values, and handles, and per-iteration RNG streams are forked
//! from the run seed, so outcomes are identical at any worker count.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::error::{HarnessError, HarnessResult};
use crate::generate::{self, GenConfig, GeneratedCase};
use crate::model::{Candidate, CandidateSet, ModelOutcome, select};
use crate::refinement::RefinementEngine;
use crate::registry::{Action, ActionKind, ActionRegistry};
use crate::state::{LocalState, ProphecyValues};
use crate::witness::{Outcome, Phase, RunReport, TestFrame, WitnessLog};

/// What the implementation reports about its own effect.
///
/// The runner uses this for the stutter guard: a `Committed` write must
/// never pass solely through a stuttering model candidate, which would
/// vacuously accept an action that actually mutated state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImplEffect {
    /// The action performed its effect (e.g. the write landed).
    Committed,
    /// The action performed no observable effect (e.g. a predicted
    /// timeout path short-circuited before the write).
    Skipped,
}

type ImplSetupFn<I> = Arc<dyn Fn(&LocalState) -> HarnessResult<I> + Send + Sync>;
type ModelSetupFn<M> = Arc<dyn Fn(&LocalState) -> HarnessResult<M> + Send + Sync>;
type RunImplFn<I> =
    Arc<dyn Fn(&mut I, &LocalState, &ProphecyValues) -> HarnessResult<ImplEffect> + Send + Sync>;
type RunModelFn<M> = Arc<dyn Fn(&M, &LocalState) -> ModelOutcome<M> + Send + Sync>;
type ImplTeardownFn<I> = Arc<dyn Fn(&mut I) -> HarnessResult<()> + Send + Sync>;
type ModelTeardownFn<M> = Arc<dyn Fn(&mut M) -> HarnessResult<()> + Send + Sync>;

/// Integration hooks binding one action to the implementation and model
/// under test.
///
/// `run_impl` receives the prophecy values so it can configure test doubles
/// (timeouts, interleavings) down the predicted path; the implementation
/// itself must never observe them.
pub struct ActionBinding<I, M> {
    impl_setup: ImplSetupFn<I>,
    model_setup: ModelSetupFn<M>,
    run_impl: RunImplFn<I>,
    run_model: RunModelFn<M>,
    impl_teardown: ImplTeardownFn<I>,
    model_teardown: Option<ModelTeardownFn<M>>,
}

impl<I, M> Clone for ActionBinding<I, M> {
    fn clone(&self) -> Self {
        Self {
            impl_setup: Arc::clone(&self.impl_setup),
            model_setup: Arc::clone(&self.model_setup),
            run_impl: Arc::clone(&self.run_impl),
            run_model: Arc::clone(&self.run_model),
            impl_teardown: Arc::clone(&self.impl_teardown),
            model_teardown: self.model_teardown.as_ref().map(Arc::clone),
        }
    }
}

impl<I, M> ActionBinding<I, M> {
    /// Build a binding from the four mandatory hooks plus implementation
    /// teardown.
    pub fn new<FS, MS, RI, RM, IT>(
        impl_setup: FS,
        model_setup: MS,
        run_impl: RI,
        run_model: RM,
        impl_teardown: IT,
    ) -> Self
    where
        FS: Fn(&LocalState) -> HarnessResult<I> + Send + Sync + 'static,
        MS: Fn(&LocalState) -> HarnessResult<M> + Send + Sync + 'static,
        RI: Fn(&mut I, &LocalState, &ProphecyValues) -> HarnessResult<ImplEffect>
            + Send
            + Sync
            + 'static,
        RM: Fn(&M, &LocalState) -> ModelOutcome<M> + Send + Sync + 'static,
        IT: Fn(&mut I) -> HarnessResult<()> + Send + Sync + 'static,
    {
        Self {
            impl_setup: Arc::new(impl_setup),
            model_setup: Arc::new(model_setup),
            run_impl: Arc::new(run_impl),
            run_model: Arc::new(run_model),
            impl_teardown: Arc::new(impl_teardown),
            model_teardown: None,
        }
    }

    /// Attach an optional model teardown hook (models are usually plain
    /// values; implementations hold the real resources).
    #[must_use]
    pub fn with_model_teardown<MT>(mut self, model_teardown: MT) -> Self
    where
        MT: Fn(&mut M) -> HarnessResult<()> + Send + Sync + 'static,
    {
        self.model_teardown = Some(Arc::new(model_teardown));
        self
    }
}

/// Per-run configuration.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Iterations per action under the random strategy. Category-partition
    /// actions emit one iteration per surviving combination instead.
    pub num_runs: u64,
    /// Run seed. `None` derives one from wall-clock time; the derived seed
    /// is logged and every frame records its own case seed, so failures
    /// stay reproducible either way.
    pub seed: Option<u64>,
    /// Stop scheduling new iterations after the first assertion failure.
    pub stop_on_first_failure: bool,
    /// Worker threads. 1 means fully sequential.
    pub workers: usize,
    /// Serialize whole iterations against a shared external dependency.
    /// All-or-nothing: partial isolation would reintroduce exactly the
    /// nondeterminism the harness controls for.
    pub exclusive_iterations: bool,
    /// Abort the run on setup/teardown/prophecy-desync errors. Assertion
    /// failures never abort unless `stop_on_first_failure`.
    pub abort_on_infra_error: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            num_runs: 100,
            seed: None,
            stop_on_first_failure: false,
            workers: 1,
            exclusive_iterations: false,
            abort_on_infra_error: true,
        }
    }
}

impl RunConfig {
    /// Default configuration with a fixed seed.
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self {
            seed: Some(seed),
            ..Self::default()
        }
    }

    /// Override the iteration count.
    #[must_use]
    pub fn with_num_runs(mut self, num_runs: u64) -> Self {
        self.num_runs = num_runs;
        self
    }

    /// Stop after the first assertion failure.
    #[must_use]
    pub fn with_stop_on_first_failure(mut self, stop: bool) -> Self {
        self.stop_on_first_failure = stop;
        self
    }

    /// Set the worker count (minimum 1).
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Serialize whole iterations against a shared external dependency.
    #[must_use]
    pub fn with_exclusive_iterations(mut self, exclusive: bool) -> Self {
        self.exclusive_iterations = exclusive;
        self
    }
}

/// A registered action with its hooks and generator configuration.
struct Entry<I, M> {
    action: Arc<Action>,
    binding: ActionBinding<I, M>,
    gen_config: GenConfig,
}

/// The assembled suite: action registry, bindings, refinement mappings, and
/// generator configurations. Populated before the run, immutable during it.
pub struct ConformanceSuite<I, M> {
    registry: ActionRegistry,
    entries: BTreeMap<String, Entry<I, M>>,
    refinement: RefinementEngine<I, M>,
}

impl<I, M> Default for ConformanceSuite<I, M> {
    fn default() -> Self {
        Self {
            registry: ActionRegistry::new(),
            entries: BTreeMap::new(),
            refinement: RefinementEngine::new(),
        }
    }
}

impl<I, M> ConformanceSuite<I, M> {
    /// Empty suite.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action with its hooks, using the random generator
    /// strategy by default.
    pub fn register(&mut self, action: Action, binding: ActionBinding<I, M>) -> HarnessResult<()> {
        self.register_with(action, binding, GenConfig::random())
    }

    /// Register an action with its hooks and an explicit generator
    /// configuration.
    pub fn register_with(
        &mut self,
        action: Action,
        binding: ActionBinding<I, M>,
        gen_config: GenConfig,
    ) -> HarnessResult<()> {
        let name = action.name.clone();
        self.registry.register(action)?;
        let action = self.registry.resolve(&name)?;
        self.entries.insert(
            name,
            Entry {
                action,
                binding,
                gen_config,
            },
        );
        Ok(())
    }

    /// Register the refinement mapping for an action.
    pub fn register_mapping<F>(&mut self, action: impl Into<String>, mapping: F) -> HarnessResult<()>
    where
        F: Fn(&I, &ProphecyValues) -> HarnessResult<M> + Send + Sync + 'static,
    {
        self.refinement.register(action, mapping)
    }

    /// The action registry.
    #[must_use]
    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    /// The refinement engine.
    #[must_use]
    pub fn refinement(&self) -> &RefinementEngine<I, M> {
        &self.refinement
    }
}

impl<I, M> ConformanceSuite<I, M>
where
    I: Clone + Into<M>,
{
    /// Identity-like refinement mapping for convertible state types.
    pub fn register_identity_mapping(&mut self, action: impl Into<String>) -> HarnessResult<()> {
        self.refinement.register_identity(action)
    }
}

/// Drives a suite through its iterations and collects witnesses.
pub struct Runner<'a, I, M> {
    suite: &'a ConformanceSuite<I, M>,
    config: RunConfig,
    iteration_lock: Mutex<()>,
}

impl<'a, I, M> Runner<'a, I, M>
where
    I: Send,
    M: Clone + PartialEq + core::fmt::Debug + Serialize + Send,
{
    /// Build a runner over a populated suite.
    #[must_use]
    pub fn new(suite: &'a ConformanceSuite<I, M>, config: RunConfig) -> Self {
        Self {
            suite,
            config,
            iteration_lock: Mutex::new(()),
        }
    }

    /// Run every registered action and return the witness report.
    ///
    /// Fails only when every action's generator is unsatisfiable; all other
    /// trouble (assertion failures, infrastructure errors) is reported
    /// through the returned frames and the report's exit code.
    pub fn run(&self) -> HarnessResult<RunReport> {
        let seed = self.config.seed.unwrap_or_else(derive_seed);
        debug!(seed, workers = self.config.workers, "conformance run start");

        let log = WitnessLog::new();
        let mut worklist: Vec<(&Entry<I, M>, GeneratedCase)> = Vec::new();
        let mut unsatisfiable = 0usize;
        let mut first_unsat: Option<HarnessError> = None;

        for entry in self.suite.entries.values() {
            match generate::plan(&entry.action, &entry.gen_config, seed, self.config.num_runs) {
                Ok(cases) => {
                    for case in cases {
                        worklist.push((entry, case));
                    }
                }
                Err(err @ HarnessError::UnsatisfiableConstraint { .. }) => {
                    // Per-action failure: recorded, but only fatal when
                    // every action is unsatisfiable.
                    warn!(action = %entry.action.name, %err, "generator unsatisfiable");
                    log.record(TestFrame {
                        action: entry.action.name.clone(),
                        iteration: 0,
                        seed,
                        local_state: LocalState::empty(),
                        prophecy: ProphecyValues::none(),
                        combo_labels: None,
                        outcome: Outcome::Errored {
                            phase: Phase::Generated,
                            detail: err.to_string(),
                        },
                    });
                    unsatisfiable += 1;
                    first_unsat.get_or_insert(err);
                }
                Err(err) => return Err(err),
            }
        }

        if !self.suite.entries.is_empty() && unsatisfiable == self.suite.entries.len() {
            // Checked above: at least one unsatisfiable error was recorded.
            return Err(first_unsat.unwrap_or_else(|| HarnessError::hook("empty suite")));
        }

        let stop = AtomicBool::new(false);
        let next = AtomicUsize::new(0);
        let workers = self.config.workers.max(1).min(worklist.len().max(1));

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        if stop.load(Ordering::Acquire) {
                            break;
                        }
                        let index = next.fetch_add(1, Ordering::AcqRel);
                        let Some((entry, case)) = worklist.get(index) else {
                            break;
                        };
                        let frame = self.run_case(entry, case);
                        self.observe_outcome(&frame.outcome, &stop);
                        log.record(frame);
                    }
                });
            }
        });

        Ok(log.into_report())
    }

    /// Re-run one recorded case with fixed inputs. This is the
    /// reproducibility path: given a witness's literal local state and
    /// prophecy values, the outcome is identical to the recorded one.
    pub fn replay(
        &self,
        action: &str,
        local_state: LocalState,
        prophecy: ProphecyValues,
    ) -> HarnessResult<TestFrame> {
        let entry = self
            .suite
            .entries
            .get(action)
            .ok_or_else(|| HarnessError::UnknownAction {
                name: action.to_string(),
            })?;
        let case = GeneratedCase {
            iteration: 0,
            seed: 0,
            local_state,
            prophecy,
            combo_labels: None,
        };
        Ok(self.run_case(entry, &case))
    }

    fn observe_outcome(&self, outcome: &Outcome, stop: &AtomicBool) {
        match outcome {
            Outcome::Failed { .. } if self.config.stop_on_first_failure => {
                stop.store(true, Ordering::Release);
            }
            Outcome::Errored { detail, phase } if self.config.abort_on_infra_error => {
                error!(%phase, %detail, "infrastructure error, aborting run");
                stop.store(true, Ordering::Release);
            }
            _ => {}
        }
    }

    /// One full iteration of the state machine. Teardown runs on every path
    /// that acquired a handle, exactly once per handle: the implementation
    /// handle from ImplSetup on, the model handle from ModelSetup on.
    fn run_case(&self, entry: &Entry<I, M>, case: &GeneratedCase) -> TestFrame {
        let _exclusive = self
            .config
            .exclusive_iterations
            .then(|| self.iteration_lock.lock());

        let action = &entry.action;
        let binding = &entry.binding;
        debug!(action = %action.name, iteration = case.iteration, "iteration start");

        let frame = |outcome: Outcome| TestFrame {
            action: action.name.clone(),
            iteration: case.iteration,
            seed: case.seed,
            local_state: case.local_state.clone(),
            prophecy: case.prophecy.clone(),
            combo_labels: case.combo_labels.clone(),
            outcome,
        };

        // ImplSetup: nothing acquired yet on failure, no teardown owed.
        let mut impl_handle =
            match hook(Phase::ImplSetup, || (binding.impl_setup)(&case.local_state)) {
                Ok(handle) => handle,
                Err(outcome) => return frame(outcome),
            };

        // From here on, every exit path must pass through `teardown`; a
        // model handle acquired by ModelSetup is owed teardown as well, no
        // matter which later phase bails out.
        let (pre_teardown, model_handle) =
            match hook(Phase::ModelSetup, || (binding.model_setup)(&case.local_state)) {
                Ok(model_pre) => {
                    let outcome = self.execute_phases(entry, case, &mut impl_handle, &model_pre);
                    (outcome, Some(model_pre))
                }
                Err(outcome) => (outcome, None),
            };
        let outcome = self.teardown(binding, impl_handle, model_handle, pre_teardown);
        if !outcome.is_pass() {
            warn!(action = %action.name, iteration = case.iteration, ?outcome, "iteration did not pass");
        }
        frame(outcome)
    }

    /// Executed through Asserted. Returns the pre-teardown outcome; never
    /// touches either teardown hook.
    fn execute_phases(
        &self,
        entry: &Entry<I, M>,
        case: &GeneratedCase,
        impl_handle: &mut I,
        model_pre: &M,
    ) -> Outcome {
        let action = &entry.action;
        let binding = &entry.binding;

        // Executed: implementation first, then model. Both complete before
        // mapping; the assertion never races in-flight effects.
        let effect = match hook(Phase::Executed, || {
            (binding.run_impl)(impl_handle, &case.local_state, &case.prophecy)
        }) {
            Ok(effect) => effect,
            Err(outcome) => return outcome,
        };
        let model_outcome = match hook(Phase::Executed, || {
            Ok((binding.run_model)(model_pre, &case.local_state))
        }) {
            Ok(outcome) => outcome,
            Err(outcome) => return outcome,
        };

        let mapped = match hook(Phase::Mapped, || {
            self.suite
                .refinement
                .apply(&action.name, impl_handle, &case.prophecy)
        }) {
            Ok(mapped) => mapped,
            Err(outcome) => return outcome,
        };

        assert_conformance(action, effect, &mapped, model_outcome, &case.prophecy)
    }

    /// Model then implementation teardown, unconditionally. A teardown
    /// failure overrides the pre-teardown outcome: the harness itself is
    /// broken and later iterations would be unreliable. The implementation
    /// teardown runs even when the model teardown fails.
    fn teardown(
        &self,
        binding: &ActionBinding<I, M>,
        mut impl_handle: I,
        mut model_handle: Option<M>,
        pre_teardown: Outcome,
    ) -> Outcome {
        let mut outcome = pre_teardown;
        if let (Some(model_teardown), Some(model)) =
            (&binding.model_teardown, model_handle.as_mut())
        {
            if let Err(teardown_outcome) = hook_teardown(|| model_teardown(model)) {
                outcome = teardown_outcome;
            }
        }
        match hook_teardown(|| (binding.impl_teardown)(&mut impl_handle)) {
            Ok(()) => outcome,
            Err(teardown_outcome) => teardown_outcome,
        }
    }
}

/// Run a hook, converting errors and panics into an `Errored` outcome for
/// the given phase.
fn hook<T>(phase: Phase, f: impl FnOnce() -> HarnessResult<T>) -> Result<T, Outcome> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(Outcome::Errored {
            phase,
            detail: err.to_string(),
        }),
        Err(panic) => Err(Outcome::Errored {
            phase,
            detail: format!("hook panicked: {}", panic_detail(panic.as_ref())),
        }),
    }
}

fn hook_teardown(f: impl FnOnce() -> HarnessResult<()>) -> Result<(), Outcome> {
    hook(Phase::TornDown, f)
}

fn panic_detail(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "<non-string payload>".to_string())
}

/// The assertion step: structural equality for deterministic actions,
/// prophecy-narrowed equality or exploratory set membership for
/// nondeterministic ones.
fn assert_conformance<M>(
    action: &Action,
    effect: ImplEffect,
    mapped: &M,
    model_outcome: ModelOutcome<M>,
    prophecy: &ProphecyValues,
) -> Outcome
where
    M: Clone + PartialEq + core::fmt::Debug + Serialize,
{
    match model_outcome {
        ModelOutcome::Deterministic(expected) => {
            if *mapped == expected {
                Outcome::Passed
            } else {
                failed(
                    "mapped implementation state diverged from model state",
                    mapped,
                    &expected,
                )
            }
        }
        ModelOutcome::Nondet(set) => {
            // Prophecy-narrowed when the action declares a choice point;
            // exploratory membership otherwise. The first declared choice
            // point indexes the candidate set; further choice points only
            // configure test doubles.
            if let Some(spec) = action.prophecy.first() {
                let Some(choice) = prophecy.get(&spec.name) else {
                    return Outcome::Errored {
                        phase: Phase::Asserted,
                        detail: format!("missing prophecy choice `{}`", spec.name),
                    };
                };
                match select(&action.name, &set, choice) {
                    Ok(candidate) => {
                        if *mapped == candidate.state {
                            Outcome::Passed
                        } else {
                            failed(
                                "mapped implementation state diverged from prophecy-selected candidate",
                                mapped,
                                &candidate.state,
                            )
                        }
                    }
                    Err(err) => Outcome::Errored {
                        phase: Phase::Asserted,
                        detail: err.to_string(),
                    },
                }
            } else {
                assert_membership(action, effect, mapped, &set)
            }
        }
    }
}

/// Exploratory membership with the stutter guard: a committed write is
/// never accepted solely through a no-op candidate.
fn assert_membership<M>(
    action: &Action,
    effect: ImplEffect,
    mapped: &M,
    set: &CandidateSet<M>,
) -> Outcome
where
    M: Clone + PartialEq + core::fmt::Debug + Serialize,
{
    let guard_stutter = action.kind == ActionKind::Write && effect == ImplEffect::Committed;
    let mut matched_stutter_only = false;
    for candidate in set.candidates() {
        if candidate.state != *mapped {
            continue;
        }
        if guard_stutter && candidate.stutter {
            matched_stutter_only = true;
            continue;
        }
        return Outcome::Passed;
    }

    let detail = if matched_stutter_only {
        "committed write matched only a stuttering candidate".to_string()
    } else {
        format!(
            "mapped implementation state not in model candidate set ({} candidates)",
            set.len()
        )
    };
    Outcome::Failed {
        detail,
        mapped: to_value(mapped),
        expected: Value::Array(
            set.candidates()
                .iter()
                .map(|c: &Candidate<M>| to_value(&c.state))
                .collect(),
        ),
    }
}

fn failed<M: Serialize + core::fmt::Debug>(detail: &str, mapped: &M, expected: &M) -> Outcome {
    Outcome::Failed {
        detail: format!("{detail}: mapped={mapped:?} expected={expected:?}"),
        mapped: to_value(mapped),
        expected: to_value(expected),
    }
}

fn to_value<M: Serialize>(state: &M) -> Value {
    serde_json::to_value(state).unwrap_or(Value::Null)
}

/// Wall-clock-derived seed for unseeded runs. Logged at run start; every
/// frame still records its own case seed, so failures stay reproducible.
fn derive_seed() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0x5eed_0000_0000_0000, |d| {
            d.as_nanos() as u64 ^ 0x9e37_79b9_7f4a_7c15
        })
}
