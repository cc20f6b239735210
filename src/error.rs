//! Harness error taxonomy.
//!
//! Assertion failures are deliberately *not* errors: they are the signal the
//! harness exists to produce, and live in [`crate::witness::Outcome`]. The
//! variants here cover harness misuse and infrastructure trouble, which have
//! different propagation rules (see the runner's abort policy).

use thiserror::Error;

/// Errors raised by the conformance harness itself.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HarnessError {
    /// An action with this name was already registered.
    #[error("action `{name}` is already registered")]
    DuplicateAction {
        /// Name of the colliding action.
        name: String,
    },

    /// No action (or no refinement mapping) registered under this name.
    #[error("unknown action `{name}`")]
    UnknownAction {
        /// The unresolved name.
        name: String,
    },

    /// The generator could not produce a valid local state within the retry
    /// bound. Reported per action; the run aborts only if every action is
    /// unsatisfiable.
    #[error("no valid local state for action `{action}` after {attempts} attempts")]
    UnsatisfiableConstraint {
        /// Action whose constraints could not be satisfied.
        action: String,
        /// Number of candidate states tried before giving up.
        attempts: u32,
    },

    /// A prophecy choice selected a candidate the model never enumerated.
    /// This means the model's nondeterminism enumeration and the generator's
    /// prophecy domain drifted out of sync: a harness-authoring bug, surfaced
    /// loudly and never clamped.
    #[error(
        "prophecy choice `{choice}` out of range for action `{action}` ({cardinality} candidates)"
    )]
    ProphecyOutOfRange {
        /// Action whose candidate set was indexed.
        action: String,
        /// The offending index or branch tag, rendered for diagnostics.
        choice: String,
        /// Cardinality of the candidate set at selection time.
        cardinality: usize,
    },

    /// Implementation or model setup failed (external dependency unreachable,
    /// seed projection rejected, ...). Fatal to the run by default.
    #[error("setup failed: {detail}")]
    Setup {
        /// Human-readable failure description.
        detail: String,
    },

    /// Teardown failed after an iteration. Fatal to the run by default since
    /// leaked resources make the remaining iterations unreliable.
    #[error("teardown failed: {detail}")]
    Teardown {
        /// Human-readable failure description.
        detail: String,
    },

    /// An integrator-supplied hook (action invocation, refinement mapping)
    /// returned an error or panicked.
    #[error("hook failed: {detail}")]
    Hook {
        /// Human-readable failure description.
        detail: String,
    },
}

impl HarnessError {
    /// Shorthand for a setup error.
    #[must_use]
    pub fn setup(detail: impl Into<String>) -> Self {
        Self::Setup {
            detail: detail.into(),
        }
    }

    /// Shorthand for a teardown error.
    #[must_use]
    pub fn teardown(detail: impl Into<String>) -> Self {
        Self::Teardown {
            detail: detail.into(),
        }
    }

    /// Shorthand for a hook error.
    #[must_use]
    pub fn hook(detail: impl Into<String>) -> Self {
        Self::Hook {
            detail: detail.into(),
        }
    }

    /// Returns `true` for registry misuse (duplicate/unknown action), which
    /// is fatal at startup.
    #[must_use]
    pub fn is_registry_misuse(&self) -> bool {
        matches!(
            self,
            Self::DuplicateAction { .. } | Self::UnknownAction { .. }
        )
    }

    /// Returns `true` for infrastructure failures that abort the run by
    /// default (setup/teardown trouble, desynchronized prophecy domains).
    #[must_use]
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::Setup { .. } | Self::Teardown { .. } | Self::ProphecyOutOfRange { .. }
        )
    }
}

/// Result alias used across the harness.
pub type HarnessResult<T> = Result<T, HarnessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(
            HarnessError::DuplicateAction {
                name: "a".to_string()
            }
            .is_registry_misuse()
        );
        assert!(
            HarnessError::UnknownAction {
                name: "a".to_string()
            }
            .is_registry_misuse()
        );
        assert!(HarnessError::setup("db unreachable").is_infrastructure());
        assert!(HarnessError::teardown("txn leaked").is_infrastructure());
        assert!(
            HarnessError::ProphecyOutOfRange {
                action: "read".to_string(),
                choice: "2".to_string(),
                cardinality: 2,
            }
            .is_infrastructure()
        );
        assert!(!HarnessError::hook("boom").is_infrastructure());
    }

    #[test]
    fn display_carries_context() {
        let err = HarnessError::UnsatisfiableConstraint {
            action: "create".to_string(),
            attempts: 64,
        };
        let text = err.to_string();
        assert!(text.contains("create"));
        assert!(text.contains("64"));

        let err = HarnessError::ProphecyOutOfRange {
            action: "read".to_string(),
            choice: "branch `late`".to_string(),
            cardinality: 2,
        };
        assert!(err.to_string().contains("late"));
    }
}
