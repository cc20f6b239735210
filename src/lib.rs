//! Refinelab: model-based conformance testing through refinement mappings.
//!
//! # Overview
//!
//! Refinelab validates an implementation against an abstract reference model
//! one action at a time. Each iteration generates a local state, executes the
//! action on both systems, maps the implementation state into the model's
//! state space through a registered refinement mapping, and asserts
//! structural equality. Nondeterministic actions are handled with prophecy
//! values: the generator picks the permitted branch up front, the model
//! enumerates its candidate post-states, and the assertion compares against
//! exactly the predicted candidate.
//!
//! # Core Guarantees
//!
//! - **Reproducibility**: every outcome is a pure function of the run seed;
//!   failures replay from the literal witness, at any worker count
//! - **Scoped generation**: generated local state never strays outside an
//!   action's declared touched state variables
//! - **One legal comparison path**: implementation state reaches the model's
//!   state space only through the refinement mapping
//! - **Teardown totality**: resources acquired by an iteration are released
//!   on every exit path, including assertion failure and hook panic
//! - **No vacuous passes**: a committed write never passes solely through a
//!   stuttering (no-op) model candidate
//!
//! # Module Structure
//!
//! - [`registry`]: action declarations (schemas, touched keys, choice points)
//! - [`generate`]: random and category-partition local-state generation
//! - [`model`]: nondeterministic model adapter and candidate selection
//! - [`refinement`]: refinement mapping registration and application
//! - [`runner`]: the per-iteration state machine and the run loop
//! - [`witness`]: test frames, run reports, and rendering
//! - [`state`]: local state, prophecy choices and values
//! - [`rng`]: deterministic splittable RNG streams
//! - [`error`](mod@error): error types
//!
//! # Quick Start
//!
//! ```
//! use refinelab::{
//!     Action, ActionBinding, ActionKind, ConformanceSuite, FieldKind, FieldSpec, ImplEffect,
//!     ModelOutcome, RunConfig, Runner,
//! };
//!
//! # fn main() -> Result<(), refinelab::HarnessError> {
//! let action = Action::builder("increment", ActionKind::Write)
//!     .field(FieldSpec::new("value", FieldKind::Int { min: 0, max: 100 }))
//!     .build();
//!
//! let seed = |state: &refinelab::LocalState| {
//!     state.get("value").and_then(serde_json::Value::as_i64).unwrap_or(0)
//! };
//! let binding = ActionBinding::new(
//!     move |state| Ok(seed(state)),
//!     move |state| Ok(seed(state)),
//!     |value, _state, _prophecy| {
//!         *value += 1;
//!         Ok(ImplEffect::Committed)
//!     },
//!     |pre, _state| ModelOutcome::Deterministic(pre + 1),
//!     |_value| Ok(()),
//! );
//!
//! let mut suite = ConformanceSuite::new();
//! suite.register(action, binding)?;
//! suite.register_mapping("increment", |value: &i64, _prophecy| Ok(*value))?;
//!
//! let report = Runner::new(&suite, RunConfig::seeded(7)).run()?;
//! assert!(report.is_success());
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod generate;
pub mod model;
pub mod refinement;
pub mod registry;
pub mod rng;
pub mod runner;
pub mod state;
pub mod witness;

pub use error::{HarnessError, HarnessResult};
pub use generate::{GenConfig, GenStrategy, GeneratedCase};
pub use generate::partition::{Category, Choice, ComboView, PartitionSpec};
pub use model::{Candidate, CandidateSet, ModelOutcome, NondetModel};
pub use refinement::RefinementEngine;
pub use registry::{
    Action, ActionBuilder, ActionKind, ActionRegistry, FieldKind, FieldSpec, ProphecySpec,
};
pub use rng::DetRng;
pub use runner::{ActionBinding, ConformanceSuite, ImplEffect, RunConfig, Runner};
pub use state::{LocalState, ProphecyChoice, ProphecyValues};
pub use witness::{Outcome, Phase, RunReport, RunSummary, TestFrame};
