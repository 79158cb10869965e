use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use super::backend::{InvocationContext, ToolBackend, ToolOutput};
use helm_tools::{ToolDefinition, ToolError, ToolProvider};

/// Invokes registry-backed tools with a JSON-RPC 2.0 `tools/call` POST.
pub struct RegistryBackend {
    namespace: String,
    invoke_url: String,
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl RegistryBackend {
    pub fn new(namespace: impl Into<String>, invoke_url: impl Into<String>) -> Self {
        Self::with_client(namespace, invoke_url, reqwest::Client::new())
    }

    pub fn with_client(
        namespace: impl Into<String>,
        invoke_url: impl Into<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            invoke_url: invoke_url.into(),
            client,
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl ToolBackend for RegistryBackend {
    fn name(&self) -> &str {
        &self.namespace
    }

    async fn invoke(
        &self,
        definition: &ToolDefinition,
        payload: Value,
        ctx: &InvocationContext,
    ) -> Result<ToolOutput, ToolError> {
        let tool_name = definition.qualified_name();
        let remote_id = match &definition.provider {
            ToolProvider::RegistryBacked { remote_id, .. } => remote_id.clone(),
            _ => definition.id.to_string(),
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": {
                "name": remote_id,
                "arguments": payload,
                "meta": {"run_id": ctx.run_id, "call_id": ctx.call_id},
            },
        });

        debug!(target: "helm::registry", tool = %tool_name, url = %self.invoke_url, "Invoking registry tool");
        let response = self
            .client
            .post(&self.invoke_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ToolError::retryable(&tool_name, format!("Request failed: {e}")))?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ToolError::retryable(
                &tool_name,
                format!("Registry returned {status}"),
            ));
        }
        if !status.is_success() {
            return Err(ToolError::terminal(
                &tool_name,
                format!("Registry returned {status}"),
            ));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ToolError::terminal(&tool_name, format!("Invalid response: {e}")))?;
        parse_call_response(&tool_name, body)
    }
}

/// Interpret a JSON-RPC `tools/call` response body.
fn parse_call_response(tool_name: &str, body: Value) -> Result<ToolOutput, ToolError> {
    if let Some(error) = body.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("remote error")
            .to_string();
        return Err(match code {
            -32602 => ToolError::invalid_payload(tool_name, message),
            -32601 => ToolError::unknown(tool_name),
            _ => ToolError::terminal(tool_name, message),
        });
    }

    let result = body
        .get("result")
        .cloned()
        .ok_or_else(|| ToolError::terminal(tool_name, "Response has no result"))?;
    if result.get("isError").and_then(Value::as_bool) == Some(true) {
        let message = result
            .get("content")
            .map_or_else(|| "remote tool failed".to_string(), Value::to_string);
        return Err(ToolError::terminal(tool_name, message));
    }

    let value = result
        .get("structuredContent")
        .or_else(|| result.get("result"))
        .cloned()
        .unwrap_or(result.clone());
    let sidecar = result.get("sidecar").cloned();
    Ok(ToolOutput {
        result: value,
        sidecar,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn reads_structured_result_and_sidecar() {
        let output = parse_call_response(
            "r.t",
            json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": {"structuredContent": {"ok": true}, "sidecar": {"ui": 1}}
            }),
        )
        .unwrap();
        assert_eq!(output.result, json!({"ok": true}));
        assert_eq!(output.sidecar, Some(json!({"ui": 1})));
    }

    #[rstest]
    #[case(json!({"error": {"code": -32602, "message": "bad"}}), "invalid_payload")]
    #[case(json!({"error": {"code": -32601, "message": "no"}}), "unknown_tool")]
    #[case(json!({"error": {"code": -32000, "message": "boom"}}), "backend_error")]
    #[case(json!({"result": {"isError": true, "content": []}}), "backend_error")]
    fn maps_remote_errors(#[case] body: Value, #[case] code: &str) {
        let err = parse_call_response("r.t", body).unwrap_err();
        assert_eq!(err.result_code().as_str(), code);
        assert!(!err.is_retryable());
    }
}
