mod error;
pub mod naming;
pub mod retry;

pub use error::ApiError;
pub use naming::ToolNameMap;
pub use retry::RetryingClient;

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::types::{CallId, RunId};
use helm_tools::{ResultCode, ToolDefinition};

/// One turn of the conversation as the model sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    User {
        text: String,
    },
    Assistant {
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
    },
}

/// A tool as advertised to the model, under its sanitized name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolSpec {
    pub fn from_definition(definition: &ToolDefinition, names: &ToolNameMap) -> Option<Self> {
        let canonical = definition.qualified_name();
        let name = names.sanitized(&canonical)?.to_string();
        let description = if definition.description.is_empty() {
            definition.title.clone()
        } else {
            definition.description.clone()
        };
        Some(Self {
            name,
            description,
            input_schema: definition.payload_schema(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum ToolChoice {
    #[default]
    Auto,
    Any,
    None,
    Tool(String),
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub call_id: CallId,
    pub tool_name: String,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    ContentFiltered,
    Other(String),
}

impl StopReason {
    /// Only a natural end of turn completes a run.
    pub fn is_success(&self) -> bool {
        matches!(self, StopReason::EndTurn)
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::EndTurn => f.write_str("end_turn"),
            StopReason::MaxTokens => f.write_str("max_tokens"),
            StopReason::ContentFiltered => f.write_str("content_filtered"),
            StopReason::Other(reason) => f.write_str(reason),
        }
    }
}

pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, ApiError>> + Send>>;

pub enum GenerateResult {
    /// Text chunks in provider order.
    Text(TextStream),
    ToolCalls(Vec<ToolCallRequest>),
    Stop(StopReason),
}

impl fmt::Debug for GenerateResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerateResult::Text(_) => f.write_str("Text(..)"),
            GenerateResult::ToolCalls(calls) => f.debug_tuple("ToolCalls").field(calls).finish(),
            GenerateResult::Stop(reason) => f.debug_tuple("Stop").field(reason).finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerateContext {
    pub run_id: RunId,
    pub cancel: CancellationToken,
}

impl GenerateContext {
    pub fn new(run_id: RunId, cancel: CancellationToken) -> Self {
        Self { run_id, cancel }
    }
}

/// A language model provider. Provider quirks stay inside implementations;
/// tool names in `tools` and in returned calls are the sanitized ones.
#[async_trait]
pub trait ModelClient: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn generate(
        &self,
        ctx: &GenerateContext,
        history: &[Message],
        tools: &[ToolSpec],
        tool_choice: ToolChoice,
    ) -> Result<GenerateResult, ApiError>;
}
