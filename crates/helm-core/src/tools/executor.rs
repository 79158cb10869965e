use std::sync::Arc;

use serde_json::Value;
use tracing::{Span, debug, instrument, warn};

use super::backend::{InvocationContext, ToolOutput};
use super::catalog::{CatalogEntry, ToolCatalog};
use helm_tools::ToolError;

/// Runtime dispatcher for catalog tools.
#[derive(Clone)]
pub struct ToolExecutor {
    catalog: Arc<ToolCatalog>,
}

impl ToolExecutor {
    pub fn new(catalog: Arc<ToolCatalog>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &Arc<ToolCatalog> {
        &self.catalog
    }

    pub fn resolve(&self, tool_name: &str) -> Result<Arc<CatalogEntry>, ToolError> {
        self.catalog.lookup(tool_name)
    }

    /// Validate, route to the owning backend and wait for the result, honoring
    /// the context's cancellation token and deadline.
    #[instrument(
        skip(self, payload, ctx),
        fields(tool = %tool_name, run_id = %ctx.run_id, call_id = %ctx.call_id, backend)
    )]
    pub async fn invoke(
        &self,
        tool_name: &str,
        payload: Value,
        ctx: &InvocationContext,
    ) -> Result<ToolOutput, ToolError> {
        let entry = self.catalog.lookup(tool_name)?;
        Span::current().record("backend", entry.backend.name());

        entry.validate_payload(&payload)?;

        if ctx.is_cancelled() {
            return Err(ToolError::Cancelled {
                tool_name: tool_name.to_string(),
            });
        }

        debug!(target: "helm::tools", "Dispatching tool");
        let call = entry.backend.invoke(&entry.definition, payload, ctx);
        let outcome = tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => Err(ToolError::Cancelled {
                tool_name: tool_name.to_string(),
            }),
            result = async {
                match ctx.deadline {
                    Some(deadline) => tokio::time::timeout_at(deadline, call)
                        .await
                        .unwrap_or_else(|_| Err(ToolError::Timeout {
                            tool_name: tool_name.to_string(),
                        })),
                    None => call.await,
                }
            } => result,
        };

        if let Err(error) = &outcome {
            warn!(
                target: "helm::tools",
                kind = %error.kind(),
                error = %error,
                "Tool invocation failed"
            );
        }
        outcome
    }
}
