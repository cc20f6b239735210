//! Witness recording and run reporting.
//!
//! Every iteration produces a [`TestFrame`]: the literal generated local
//! state, the prophecy choices, and the outcome. A failing frame carries
//! enough data to re-run that single case deterministically outside the
//! randomized loop — the reproducibility guarantee. Frames are never
//! mutated after creation.
//!
//! Reports render failing witnesses first, then aggregate statistics, in
//! both human-readable text and machine-parseable JSON for CI gating.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::state::{LocalState, ProphecyValues};

/// Phase of the per-iteration state machine, recorded on errored frames so
/// harness failures can be triaged without re-running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Local state and prophecy values generated.
    Generated,
    /// Implementation instance construction and seeding.
    ImplSetup,
    /// Model instance construction and seeding.
    ModelSetup,
    /// Action invoked on implementation and model.
    Executed,
    /// Refinement mapping applied to the post-implementation state.
    Mapped,
    /// Equivalence (or membership) assertion evaluated.
    Asserted,
    /// Implementation and model resources released.
    TornDown,
}

impl core::fmt::Display for Phase {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::Generated => "generated",
            Self::ImplSetup => "impl_setup",
            Self::ModelSetup => "model_setup",
            Self::Executed => "executed",
            Self::Mapped => "mapped",
            Self::Asserted => "asserted",
            Self::TornDown => "torn_down",
        };
        f.write_str(name)
    }
}

/// Terminal outcome of one iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum Outcome {
    /// Mapped implementation state matched the model.
    Passed,
    /// The core correctness signal: refinement assertion failed.
    Failed {
        /// What the assertion compared and why it failed.
        detail: String,
        /// Mapped implementation post-state, serialized.
        mapped: Value,
        /// Expected model post-state (or candidate set), serialized.
        expected: Value,
    },
    /// Setup/teardown/hook failure; the harness, not the system under test.
    Errored {
        /// Phase where the failure occurred.
        phase: Phase,
        /// Failure description.
        detail: String,
    },
}

impl Outcome {
    /// Returns `true` for [`Outcome::Passed`].
    #[must_use]
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Passed)
    }

    /// Returns `true` for [`Outcome::Failed`].
    #[must_use]
    pub fn is_fail(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Returns `true` for [`Outcome::Errored`].
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Errored { .. })
    }
}

/// Record of one generated test case. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestFrame {
    /// Action under test.
    pub action: String,
    /// Iteration index within the action's plan.
    pub iteration: u64,
    /// Per-case RNG seed.
    pub seed: u64,
    /// Literal generated local state.
    pub local_state: LocalState,
    /// Literal prophecy choices.
    pub prophecy: ProphecyValues,
    /// Category-partition labels when that strategy generated the case.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub combo_labels: Option<Vec<String>>,
    /// Terminal outcome.
    pub outcome: Outcome,
}

/// Per-action pass/fail/error counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionCounts {
    /// Passed iterations.
    pub passed: u64,
    /// Failed iterations.
    pub failed: u64,
    /// Errored iterations.
    pub errored: u64,
}

/// Aggregate run statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Total passed iterations.
    pub passed: u64,
    /// Total failed iterations.
    pub failed: u64,
    /// Total errored iterations.
    pub errored: u64,
    /// Counters per action, in name order.
    pub per_action: BTreeMap<String, ActionCounts>,
}

impl RunSummary {
    /// Returns `true` when nothing failed or errored.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.errored == 0
    }
}

/// Thread-safe witness sink shared by runner workers.
#[derive(Debug, Default)]
pub struct WitnessLog {
    frames: Mutex<Vec<TestFrame>>,
}

impl WitnessLog {
    /// Empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a frame. Frames are recorded regardless of outcome.
    pub fn record(&self, frame: TestFrame) {
        self.frames.lock().push(frame);
    }

    /// Drain into a report. Frames are ordered by `(action, iteration)` so
    /// reports are stable across worker schedules.
    #[must_use]
    pub fn into_report(self) -> RunReport {
        let mut frames = self.frames.into_inner();
        frames.sort_by(|a, b| {
            a.action
                .cmp(&b.action)
                .then(a.iteration.cmp(&b.iteration))
        });
        RunReport { frames }
    }
}

/// Final run artifact: every frame plus derived statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    frames: Vec<TestFrame>,
}

impl RunReport {
    /// All frames, ordered by `(action, iteration)`.
    #[must_use]
    pub fn frames(&self) -> &[TestFrame] {
        &self.frames
    }

    /// Frames with a failed or errored outcome.
    #[must_use]
    pub fn failing_frames(&self) -> Vec<&TestFrame> {
        self.frames
            .iter()
            .filter(|f| !f.outcome.is_pass())
            .collect()
    }

    /// Aggregate statistics.
    #[must_use]
    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary::default();
        for frame in &self.frames {
            let counts = summary.per_action.entry(frame.action.clone()).or_default();
            match &frame.outcome {
                Outcome::Passed => {
                    summary.passed += 1;
                    counts.passed += 1;
                }
                Outcome::Failed { .. } => {
                    summary.failed += 1;
                    counts.failed += 1;
                }
                Outcome::Errored { .. } => {
                    summary.errored += 1;
                    counts.errored += 1;
                }
            }
        }
        summary
    }

    /// Returns `true` when every iteration passed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.summary().is_clean()
    }

    /// Process exit code for CI gating: 0 on success, 1 otherwise.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        i32::from(!self.is_success())
    }

    /// Render a human-readable report. Failing witnesses come first, with
    /// their literal reproduction data, before any aggregate statistics.
    #[must_use]
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for frame in self.failing_frames() {
            let _ = match &frame.outcome {
                Outcome::Failed { detail, .. } => writeln!(
                    &mut out,
                    "FAIL {action}[{iter}] seed={seed}: {detail}\n  local_state: {state}\n  prophecy: {prophecy}",
                    action = frame.action,
                    iter = frame.iteration,
                    seed = frame.seed,
                    state = serde_json::to_string(&frame.local_state)
                        .unwrap_or_else(|_| "<unserializable>".to_string()),
                    prophecy = serde_json::to_string(&frame.prophecy)
                        .unwrap_or_else(|_| "<unserializable>".to_string()),
                ),
                Outcome::Errored { phase, detail } => writeln!(
                    &mut out,
                    "ERROR {action}[{iter}] seed={seed} phase={phase}: {detail}",
                    action = frame.action,
                    iter = frame.iteration,
                    seed = frame.seed,
                ),
                Outcome::Passed => Ok(()),
            };
        }

        let summary = self.summary();
        let _ = writeln!(
            &mut out,
            "run: {} passed, {} failed, {} errored",
            summary.passed, summary.failed, summary.errored
        );
        for (action, counts) in &summary.per_action {
            let _ = writeln!(
                &mut out,
                "  {action}: {} passed, {} failed, {} errored",
                counts.passed, counts.failed, counts.errored
            );
        }
        out
    }

    /// Render a machine-parseable JSON report.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let summary = self.summary();
        json!({
            "summary": summary,
            "failures": self
                .failing_frames()
                .iter()
                .map(|f| serde_json::to_value(f).unwrap_or(Value::Null))
                .collect::<Vec<_>>(),
            "frames": self.frames,
        })
    }
}
