mod log;
mod notifier;

pub use log::{EventLog, EventLogError, EventPage, tail};
pub use notifier::AppendNotifier;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::RunStatus;
use crate::types::{CallId, EventId, RunId};
use helm_tools::{ErrorKind, ResultCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    UserMessage,
    AssistantChunk,
    AssistantMessage,
    ToolCall,
    ToolResult,
    Pause,
    Resume,
    Error,
    Terminal,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::UserMessage => "user_message",
            EventType::AssistantChunk => "assistant_chunk",
            EventType::AssistantMessage => "assistant_message",
            EventType::ToolCall => "tool_call",
            EventType::ToolResult => "tool_result",
            EventType::Pause => "pause",
            EventType::Resume => "resume",
            EventType::Error => "error",
            EventType::Terminal => "terminal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    Confirmation,
    Requested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeDecision {
    Accept,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    UserMessage {
        text: String,
    },
    AssistantChunk {
        text: String,
    },
    AssistantMessage {
        text: String,
    },
    ToolCall {
        call_id: CallId,
        tool_name: String,
        payload: Value,
    },
    ToolResult {
        call_id: CallId,
        tool_name: String,
        result_code: ResultCode,
        result: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sidecar: Option<Value>,
    },
    Pause {
        reason: PauseReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<CallId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
    },
    Resume {
        decision: ResumeDecision,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
    Terminal {
        status: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl RunEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            RunEvent::UserMessage { .. } => EventType::UserMessage,
            RunEvent::AssistantChunk { .. } => EventType::AssistantChunk,
            RunEvent::AssistantMessage { .. } => EventType::AssistantMessage,
            RunEvent::ToolCall { .. } => EventType::ToolCall,
            RunEvent::ToolResult { .. } => EventType::ToolResult,
            RunEvent::Pause { .. } => EventType::Pause,
            RunEvent::Resume { .. } => EventType::Resume,
            RunEvent::Error { .. } => EventType::Error,
            RunEvent::Terminal { .. } => EventType::Terminal,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunEvent::Terminal { .. })
    }

    pub fn terminal(status: RunStatus, reason: Option<String>) -> Self {
        RunEvent::Terminal { status, reason }
    }

    /// Tool name and result code of a `tool_result`, for failure indexing.
    pub fn tool_outcome(&self) -> Option<(&str, ResultCode)> {
        match self {
            RunEvent::ToolResult {
                tool_name,
                result_code,
                ..
            } => Some((tool_name.as_str(), *result_code)),
            _ => None,
        }
    }
}

/// An appended event with its per-run sequence. Sequences start at 1 and
/// are gap-free.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub sequence: u64,
    pub event_id: EventId,
    pub run_id: RunId,
    pub occurred_at: DateTime<Utc>,
    pub event: RunEvent,
}

impl EventRecord {
    pub fn cursor(&self) -> EventCursor {
        EventCursor {
            sequence: self.sequence,
            event_id: Some(self.event_id),
        }
    }
}

/// Exclusive scan position: reads resume after `sequence`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCursor {
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<EventId>,
}

impl EventCursor {
    /// Cursor positioned after `sequence`, e.g. from an SSE `Last-Event-ID`.
    pub fn after(sequence: u64) -> Self {
        Self {
            sequence,
            event_id: None,
        }
    }
}
