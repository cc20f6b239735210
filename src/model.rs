//! Nondeterministic model adapter.
//!
//! Wraps a reference model whose actions are pure functions from
//! `(pre-state, input)` to either a single post-state or a candidate *set*
//! of post-states (races, weak isolation, timeouts). Exposes both the
//! nondeterministic query (`eval_nondet`) and the prophecy-driven
//! deterministic selection (`eval_with_prophecy`).

use std::sync::Arc;

use crate::error::{HarnessError, HarnessResult};
use crate::state::{LocalState, ProphecyChoice};

/// One candidate post-state in a nondeterministic result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate<M> {
    /// The candidate model state.
    pub state: M,
    /// Optional branch tag for named prophecy selection.
    pub tag: Option<String>,
    /// Marks a no-op candidate (pre-state unchanged), modeling a true
    /// non-event such as a dropped heartbeat. The runner refuses to let a
    /// committed write pass solely through a stutter candidate.
    pub stutter: bool,
}

impl<M> Candidate<M> {
    /// Plain candidate.
    #[must_use]
    pub fn new(state: M) -> Self {
        Self {
            state,
            tag: None,
            stutter: false,
        }
    }

    /// Candidate with a named branch tag.
    #[must_use]
    pub fn tagged(state: M, tag: impl Into<String>) -> Self {
        Self {
            state,
            tag: Some(tag.into()),
            stutter: false,
        }
    }

    /// Mark this candidate as a stuttering no-op.
    #[must_use]
    pub fn stuttering(mut self) -> Self {
        self.stutter = true;
        self
    }
}

/// Ordered set of candidate post-states. Enumeration order is the prophecy
/// index domain, so it must be stable for a given `(pre-state, input)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateSet<M> {
    candidates: Vec<Candidate<M>>,
}

impl<M> CandidateSet<M> {
    /// Empty set (a model bug if returned for a reachable input; the runner
    /// reports it as a prophecy-range failure on selection).
    #[must_use]
    pub fn empty() -> Self {
        Self {
            candidates: Vec::new(),
        }
    }

    /// Build from candidates in enumeration order.
    #[must_use]
    pub fn from_candidates(candidates: Vec<Candidate<M>>) -> Self {
        Self { candidates }
    }

    /// Build from bare states in enumeration order.
    #[must_use]
    pub fn from_states(states: Vec<M>) -> Self {
        Self {
            candidates: states.into_iter().map(Candidate::new).collect(),
        }
    }

    /// Append a candidate.
    pub fn push(&mut self, candidate: Candidate<M>) {
        self.candidates.push(candidate);
    }

    /// Candidates in enumeration order.
    #[must_use]
    pub fn candidates(&self) -> &[Candidate<M>] {
        &self.candidates
    }

    /// Number of candidates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    /// Returns `true` when no candidate is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// Result of one model action evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelOutcome<M> {
    /// Single post-state (deterministic action).
    Deterministic(M),
    /// Candidate set (nondeterministic action).
    Nondet(CandidateSet<M>),
}

/// Model action callable: pure function from pre-state and input to an
/// outcome. Purity (same inputs, same outcome, stable enumeration order) is
/// the integrator's contract; it is what makes prophecy selection
/// deterministic.
pub type ModelFn<M> = Arc<dyn Fn(&M, &LocalState) -> ModelOutcome<M> + Send + Sync>;

/// Adapter around a reference model action.
pub struct NondetModel<M> {
    action: String,
    run: ModelFn<M>,
}

impl<M: Clone + PartialEq> NondetModel<M> {
    /// Wrap a model callable for a named action.
    pub fn new<F>(action: impl Into<String>, run: F) -> Self
    where
        F: Fn(&M, &LocalState) -> ModelOutcome<M> + Send + Sync + 'static,
    {
        Self {
            action: action.into(),
            run: Arc::new(run),
        }
    }

    /// Wrap an existing shared callable.
    #[must_use]
    pub fn from_shared(action: impl Into<String>, run: ModelFn<M>) -> Self {
        Self {
            action: action.into(),
            run,
        }
    }

    /// Action name this adapter serves.
    #[must_use]
    pub fn action(&self) -> &str {
        &self.action
    }

    /// Apply the action to every pre-state and union the results.
    ///
    /// Monotonic: no reachable state is dropped. Structurally equal states
    /// are merged (first occurrence wins, preserving enumeration order and
    /// tag), which keeps the prophecy index domain stable.
    #[must_use]
    pub fn eval_nondet(&self, pre_states: &[M], input: &LocalState) -> CandidateSet<M> {
        let mut union: Vec<Candidate<M>> = Vec::new();
        for pre in pre_states {
            let outcome = (self.run)(pre, input);
            let candidates = match outcome {
                ModelOutcome::Deterministic(state) => vec![Candidate::new(state)],
                ModelOutcome::Nondet(set) => set.candidates,
            };
            for candidate in candidates {
                if !union.iter().any(|c| c.state == candidate.state) {
                    union.push(candidate);
                }
            }
        }
        CandidateSet::from_candidates(union)
    }

    /// Select exactly one candidate, deterministically, by prophecy choice.
    ///
    /// Fails with [`HarnessError::ProphecyOutOfRange`] when the index
    /// exceeds the candidate cardinality or the branch tag is unknown. The
    /// selection is never clamped: an out-of-range choice means the model's
    /// enumeration and the generator's prophecy domain have drifted apart.
    pub fn eval_with_prophecy(
        &self,
        pre_states: &[M],
        input: &LocalState,
        choice: &ProphecyChoice,
    ) -> HarnessResult<Candidate<M>> {
        let set = self.eval_nondet(pre_states, input);
        select(&self.action, &set, choice)
    }
}

/// Select one candidate from an already-evaluated set, deterministically,
/// by index or branch tag. Shared by [`NondetModel::eval_with_prophecy`]
/// and the runner's prophecy-narrowed assertion path.
pub fn select<M: Clone>(
    action: &str,
    set: &CandidateSet<M>,
    choice: &ProphecyChoice,
) -> HarnessResult<Candidate<M>> {
    let selected = match choice {
        ProphecyChoice::Index(index) => set.candidates().get(*index),
        ProphecyChoice::Branch(tag) => set
            .candidates()
            .iter()
            .find(|c| c.tag.as_deref() == Some(tag.as_str())),
    };
    selected
        .cloned()
        .ok_or_else(|| HarnessError::ProphecyOutOfRange {
            action: action.to_string(),
            choice: choice.to_string(),
            cardinality: set.len(),
        })
}
