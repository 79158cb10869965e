use serde_json::Value;

use crate::api::StopReason;
use crate::events::ResumeDecision;
use crate::tools::ToolOutput;
use crate::types::CallId;
use helm_tools::{ErrorKind, ToolError};

/// Rendered confirmation texts of a call that needs a user decision.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmationRequest {
    pub title: String,
    pub prompt: String,
    pub denied_result: String,
}

/// A model-requested call resolved against the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedCall {
    pub call_id: CallId,
    pub tool_name: String,
    pub payload: Value,
    pub confirmation: Option<ConfirmationRequest>,
    pub serial: bool,
}

impl PlannedCall {
    pub fn new(call_id: CallId, tool_name: impl Into<String>, payload: Value) -> Self {
        Self {
            call_id,
            tool_name: tool_name.into(),
            payload,
            confirmation: None,
            serial: false,
        }
    }
}

#[derive(Debug)]
pub enum ToolOutcome {
    Output(ToolOutput),
    Error(ToolError),
    /// Retryable failures outlasted the retry policy.
    Exhausted { error: ToolError, attempts: u32 },
}

/// A tool call left without a result by a previous owner of the run.
#[derive(Debug, Clone, PartialEq)]
pub struct Orphan {
    pub call: PlannedCall,
    pub idempotent: bool,
}

#[derive(Debug)]
pub enum Action {
    Start,

    /// State was rebuilt from the log by a new owner.
    Rehydrated {
        orphans: Vec<Orphan>,
        /// Logged calls still owed a confirmation pause.
        awaiting: Vec<PlannedCall>,
        confirming: Option<PlannedCall>,
    },

    ModelChunk {
        step: u32,
        text: String,
    },

    ModelFinished {
        step: u32,
    },

    ModelToolCalls {
        step: u32,
        calls: Vec<PlannedCall>,
    },

    ModelStopped {
        step: u32,
        reason: StopReason,
    },

    ModelFailed {
        step: u32,
        kind: ErrorKind,
        message: String,
    },

    ToolFinished {
        call_id: CallId,
        tool_name: String,
        outcome: ToolOutcome,
    },

    PauseRequested,

    ResumeRequested {
        decision: ResumeDecision,
    },

    CancelRequested {
        reason: Option<String>,
    },
}
