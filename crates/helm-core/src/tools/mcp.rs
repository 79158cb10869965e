use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rmcp::{
    model::CallToolRequestParam,
    service::{RoleClient, RunningService, ServiceExt},
    transport::{ConfigureCommandExt, TokioChildProcess},
};
use serde_json::{Map, Value, json};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::backend::{InvocationContext, ToolBackend, ToolOutput};
use helm_tools::{ToolDefinition, ToolError, ToolId, ToolProvider, TypedSchema};

const LIST_TOOLS_TIMEOUT: Duration = Duration::from_secs(10);

/// A tool advertised by an MCP server.
#[derive(Debug, Clone, PartialEq)]
pub struct McpToolInfo {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct McpCallResult {
    pub content: Value,
    pub structured: Option<Value>,
    pub is_error: bool,
}

/// The slice of an MCP client session the backend needs.
#[async_trait]
pub trait McpClient: Send + Sync + 'static {
    async fn list_tools(&self) -> Result<Vec<McpToolInfo>, String>;
    async fn call_tool(&self, name: &str, arguments: Map<String, Value>)
    -> Result<McpCallResult, String>;
    async fn shutdown(&self) {}
}

/// `McpClient` over an rmcp child-process session.
pub struct RmcpClient {
    server: String,
    service: Mutex<Option<RunningService<RoleClient, ()>>>,
}

impl RmcpClient {
    pub async fn spawn(server: &str, command: &str, args: &[String]) -> Result<Self, String> {
        info!(target: "helm::mcp", server, command, ?args, "Starting MCP server");
        let child = TokioChildProcess::new(Command::new(command).configure(|cmd| {
            cmd.args(args);
        }))
        .map_err(|e| format!("Failed to create MCP process: {e}"))?;

        let service = ().serve(child).await.map_err(|e| {
            error!(target: "helm::mcp", server, "Failed to serve MCP: {e}");
            format!("Failed to serve MCP: {e}")
        })?;

        Ok(Self {
            server: server.to_string(),
            service: Mutex::new(Some(service)),
        })
    }
}

#[async_trait]
impl McpClient for RmcpClient {
    async fn list_tools(&self) -> Result<Vec<McpToolInfo>, String> {
        let guard = self.service.lock().await;
        let service = guard.as_ref().ok_or("MCP service is shut down")?;
        let listed = tokio::time::timeout(LIST_TOOLS_TIMEOUT, service.list_tools(Default::default()))
            .await
            .map_err(|_| "Timeout listing tools".to_string())?
            .map_err(|e| format!("Failed to list tools: {e}"))?;

        listed
            .tools
            .iter()
            .map(|tool| {
                let value = serde_json::to_value(tool).map_err(|e| e.to_string())?;
                Ok(McpToolInfo {
                    name: tool.name.to_string(),
                    description: value
                        .get("description")
                        .and_then(Value::as_str)
                        .filter(|d| !d.is_empty())
                        .map(str::to_string),
                    input_schema: value
                        .get("inputSchema")
                        .cloned()
                        .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                })
            })
            .collect()
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<McpCallResult, String> {
        let guard = self.service.lock().await;
        let service = guard.as_ref().ok_or("MCP service is shut down")?;
        debug!(target: "helm::mcp", server = %self.server, tool = name, "Calling MCP tool");
        let result = service
            .call_tool(CallToolRequestParam {
                name: name.to_string().into(),
                arguments: Some(arguments),
            })
            .await
            .map_err(|e| format!("Tool execution failed: {e}"))?;

        let value = serde_json::to_value(&result).map_err(|e| e.to_string())?;
        Ok(McpCallResult {
            content: value.get("content").cloned().unwrap_or(Value::Null),
            structured: value.get("structuredContent").cloned(),
            is_error: value
                .get("isError")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }

    async fn shutdown(&self) {
        if let Some(service) = self.service.lock().await.take()
            && let Err(e) = service.cancel().await
        {
            error!(target: "helm::mcp", server = %self.server, "Error shutting down MCP service: {e}");
        }
    }
}

/// Backend for the tools of one MCP server, published as toolset `server`.
pub struct McpBackend {
    server: String,
    client: Arc<dyn McpClient>,
}

impl McpBackend {
    pub fn new(server: impl Into<String>, client: Arc<dyn McpClient>) -> Self {
        Self {
            server: server.into(),
            client,
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// Discover the server's tools as definitions under toolset `server`.
    pub async fn discover(&self) -> Result<Vec<ToolDefinition>, ToolError> {
        let tools = self
            .client
            .list_tools()
            .await
            .map_err(|e| ToolError::retryable(&self.server, e))?;

        let definitions: Vec<_> = tools
            .into_iter()
            .map(|tool| {
                let description = tool.description.unwrap_or_else(|| {
                    format!("Tool '{}' from MCP server '{}'", tool.name, self.server)
                });
                let mut payload = tool.input_schema;
                if let Some(obj) = payload.as_object_mut() {
                    obj.entry("type").or_insert_with(|| json!("object"));
                }
                ToolDefinition::new(
                    ToolId::new(&self.server, &tool.name),
                    ToolProvider::Mcp {
                        server: self.server.clone(),
                        tool: tool.name.clone(),
                    },
                )
                .with_description(description)
                .with_payload(TypedSchema::new(format!("{}Input", tool.name), payload))
            })
            .collect();

        info!(
            target: "helm::mcp",
            server = %self.server,
            tools = definitions.len(),
            "Discovered MCP tools"
        );
        Ok(definitions)
    }
}

#[async_trait]
impl ToolBackend for McpBackend {
    fn name(&self) -> &str {
        &self.server
    }

    async fn invoke(
        &self,
        definition: &ToolDefinition,
        payload: Value,
        _ctx: &InvocationContext,
    ) -> Result<ToolOutput, ToolError> {
        let tool_name = definition.qualified_name();
        let remote = match &definition.provider {
            ToolProvider::Mcp { tool, .. } => tool.as_str(),
            _ => definition.id.name.as_str(),
        };
        let arguments = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            _ => {
                return Err(ToolError::invalid_payload(
                    tool_name,
                    "Parameters must be an object",
                ));
            }
        };

        let result = self
            .client
            .call_tool(remote, arguments)
            .await
            .map_err(|e| ToolError::retryable(&tool_name, e))?;

        if result.is_error {
            return Err(ToolError::terminal(tool_name, text_of(&result.content)));
        }
        let value = result
            .structured
            .unwrap_or_else(|| json!({ "content": result.content }));
        Ok(ToolOutput::new(value))
    }

    async fn shutdown(&self) {
        self.client.shutdown().await;
    }
}

fn text_of(content: &Value) -> String {
    content
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .filter(|text| !text.is_empty())
        .unwrap_or_else(|| content.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CallId, RunId};
    use tokio_util::sync::CancellationToken;

    struct FakeServer;

    #[async_trait]
    impl McpClient for FakeServer {
        async fn list_tools(&self) -> Result<Vec<McpToolInfo>, String> {
            Ok(vec![McpToolInfo {
                name: "echo".into(),
                description: None,
                input_schema: json!({"properties": {"message": {"type": "string"}}}),
            }])
        }

        async fn call_tool(
            &self,
            name: &str,
            arguments: Map<String, Value>,
        ) -> Result<McpCallResult, String> {
            assert_eq!(name, "echo");
            let message = arguments.get("message").cloned().unwrap_or(Value::Null);
            Ok(McpCallResult {
                content: json!([{"type": "text", "text": message}]),
                structured: None,
                is_error: message == json!("fail"),
            })
        }
    }

    #[tokio::test]
    async fn discovers_and_invokes_server_tools() {
        let backend = McpBackend::new("fake", Arc::new(FakeServer));
        let definitions = backend.discover().await.unwrap();
        assert_eq!(definitions.len(), 1);
        let echo = &definitions[0];
        assert_eq!(echo.qualified_name(), "fake.echo");
        assert_eq!(echo.payload_schema()["type"], json!("object"));
        assert!(echo.validate().is_ok());

        let ctx = InvocationContext::new(RunId::from("r"), CallId::from("c"), CancellationToken::new());
        let output = backend
            .invoke(echo, json!({"message": "hi"}), &ctx)
            .await
            .unwrap();
        assert_eq!(output.result["content"][0]["text"], json!("hi"));

        let err = backend
            .invoke(echo, json!({"message": "fail"}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Backend { retryable: false, .. }));
    }
}
