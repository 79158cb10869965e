//! Run engine: one mailbox per active run, driven by a pure reducer.
//!
//! Every state change of a run flows through [`reduce`], which turns an
//! [`Action`] into [`Effect`]s. The run mailbox executes those effects:
//! appending to the event log before publishing on the bus, persisting the
//! run status and spawning model calls and tool invocations whose results
//! come back as further actions.

mod action;
mod actor;
mod effect;
mod engine;
mod history;
mod reduce;
mod state;

pub use action::{Action, ConfirmationRequest, Orphan, PlannedCall, ToolOutcome};
pub use effect::Effect;
pub use engine::{EngineDeps, EngineError, RunEngine, SubmitRequest};
pub use history::build_history;
pub use reduce::{ReduceError, STEP_LIMIT_REASON, reduce};
pub use state::RunState;
