use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::types::{CallId, RunId};
use helm_tools::{ToolDefinition, ToolError};

/// Per-invocation context handed to backends.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub run_id: RunId,
    pub call_id: CallId,
    pub cancel: CancellationToken,
    pub deadline: Option<Instant>,
}

impl InvocationContext {
    pub fn new(run_id: RunId, call_id: CallId, cancel: CancellationToken) -> Self {
        Self {
            run_id,
            call_id,
            cancel,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// What a tool hands back: the model-visible result and an optional
/// UI-only sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sidecar: Option<Value>,
}

impl ToolOutput {
    pub fn new(result: Value) -> Self {
        Self {
            result,
            sidecar: None,
        }
    }

    pub fn with_sidecar(mut self, sidecar: Value) -> Self {
        self.sidecar = Some(sidecar);
        self
    }
}

/// Something that can run the tools of one published toolset.
#[async_trait]
pub trait ToolBackend: Send + Sync + 'static {
    /// Short label used in logs.
    fn name(&self) -> &str;

    /// Run `definition` with an already validated payload.
    async fn invoke(
        &self,
        definition: &ToolDefinition,
        payload: Value,
        ctx: &InvocationContext,
    ) -> Result<ToolOutput, ToolError>;

    async fn shutdown(&self) {}
}
