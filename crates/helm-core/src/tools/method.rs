use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use super::backend::{InvocationContext, ToolBackend, ToolOutput};
use super::catalog::CatalogError;
use helm_tools::{
    PayloadAdapter, ResultAdapter, SidecarAdapter, ToolDefinition, ToolError, ToolId,
    ToolProvider, TypedSchema, schema_for,
};

#[derive(Debug, Clone, Error)]
pub enum MethodError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Failed(String),

    #[error("Cancelled")]
    Cancelled,
}

impl MethodError {
    fn into_tool_error(self, tool_name: &str) -> ToolError {
        match self {
            MethodError::InvalidInput(message) => ToolError::invalid_payload(tool_name, message),
            MethodError::Unavailable(message) => ToolError::retryable(tool_name, message),
            MethodError::Failed(message) => ToolError::terminal(tool_name, message),
            MethodError::Cancelled => ToolError::Cancelled {
                tool_name: tool_name.to_string(),
            },
        }
    }
}

/// A typed local service operation that can be exposed as a tool.
#[async_trait]
pub trait ServiceMethod: Send + Sync + 'static {
    type Input: DeserializeOwned + JsonSchema + Send;
    type Output: Serialize + JsonSchema + Send;

    const SERVICE: &'static str;
    const METHOD: &'static str;

    async fn call(
        &self,
        input: Self::Input,
        ctx: &InvocationContext,
    ) -> Result<Self::Output, MethodError>;

    /// Tool definition whose payload and result schemas are the method's own
    /// input and output.
    fn tool(toolset: &str, name: &str) -> ToolDefinition
    where
        Self: Sized,
    {
        ToolDefinition::new(
            ToolId::new(toolset, name),
            ToolProvider::MethodBacked {
                service: Self::SERVICE.to_string(),
                method: Self::METHOD.to_string(),
            },
        )
        .with_service(Self::SERVICE)
        .with_payload(TypedSchema::of::<Self::Input>())
        .with_result(TypedSchema::of::<Self::Output>())
    }
}

#[async_trait]
pub trait ServiceMethodErased: Send + Sync {
    fn service(&self) -> &'static str;
    fn method(&self) -> &'static str;
    fn input_schema(&self) -> Value;
    fn output_schema(&self) -> Value;

    async fn call_erased(&self, input: Value, ctx: &InvocationContext)
    -> Result<Value, MethodError>;
}

#[async_trait]
impl<T> ServiceMethodErased for T
where
    T: ServiceMethod,
{
    fn service(&self) -> &'static str {
        T::SERVICE
    }

    fn method(&self) -> &'static str {
        T::METHOD
    }

    fn input_schema(&self) -> Value {
        schema_for::<T::Input>()
    }

    fn output_schema(&self) -> Value {
        schema_for::<T::Output>()
    }

    async fn call_erased(
        &self,
        input: Value,
        ctx: &InvocationContext,
    ) -> Result<Value, MethodError> {
        let typed: T::Input =
            serde_json::from_value(input).map_err(|e| MethodError::InvalidInput(e.to_string()))?;

        if ctx.is_cancelled() {
            return Err(MethodError::Cancelled);
        }

        let output = self.call(typed, ctx).await?;
        serde_json::to_value(output).map_err(|e| MethodError::Failed(e.to_string()))
    }
}

struct Binding {
    method: Arc<dyn ServiceMethodErased>,
    payload: PayloadAdapter,
    result: ResultAdapter,
    sidecar: Option<SidecarAdapter>,
}

/// Backend for method-backed tools. Adapters are derived when a tool is
/// registered; a tool whose shapes diverge from its method is refused, so a
/// registered tool always has its adapters.
#[derive(Default)]
pub struct MethodBackend {
    bindings: HashMap<String, Binding>,
    definitions: Vec<ToolDefinition>,
}

impl MethodBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<M: ServiceMethod>(
        &mut self,
        definition: ToolDefinition,
        method: M,
    ) -> Result<(), CatalogError> {
        self.register_erased(definition, Arc::new(method))
    }

    pub fn register_erased(
        &mut self,
        definition: ToolDefinition,
        method: Arc<dyn ServiceMethodErased>,
    ) -> Result<(), CatalogError> {
        definition.validate()?;
        let tool_name = definition.qualified_name();
        if self.bindings.contains_key(&tool_name) {
            return Err(CatalogError::Duplicate {
                tool_name,
                toolset: definition.id.toolset.clone(),
            });
        }

        let adapter_error = |source| CatalogError::Adapter {
            tool_name: tool_name.clone(),
            source,
        };
        let input_schema = method.input_schema();
        let output_schema = method.output_schema();

        let payload = PayloadAdapter::derive(&definition.payload_schema(), &input_schema)
            .map_err(adapter_error)?;
        let result = match &definition.result {
            Some(result) => {
                ResultAdapter::derive(&output_schema, &result.schema, definition.bounded)
                    .map_err(adapter_error)?
            }
            None => ResultAdapter::passthrough(&output_schema, definition.bounded),
        };
        let sidecar = definition
            .sidecar
            .as_ref()
            .map(|sidecar| SidecarAdapter::derive(&output_schema, &sidecar.schema));

        debug!(
            target: "helm::tools",
            tool = %tool_name,
            service = method.service(),
            method = method.method(),
            "Registered method-backed tool"
        );
        self.bindings.insert(
            tool_name,
            Binding {
                method,
                payload,
                result,
                sidecar,
            },
        );
        self.definitions.push(definition);
        Ok(())
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.definitions.clone()
    }
}

#[async_trait]
impl ToolBackend for MethodBackend {
    fn name(&self) -> &str {
        "method"
    }

    async fn invoke(
        &self,
        definition: &ToolDefinition,
        payload: Value,
        ctx: &InvocationContext,
    ) -> Result<ToolOutput, ToolError> {
        let tool_name = definition.qualified_name();
        let binding = self
            .bindings
            .get(&tool_name)
            .ok_or_else(|| ToolError::unknown(&tool_name))?;

        let input = binding
            .payload
            .apply(&payload)
            .map_err(|e| ToolError::adapter(&tool_name, e.to_string()))?;
        let output = binding
            .method
            .call_erased(input, ctx)
            .await
            .map_err(|e| e.into_tool_error(&tool_name))?;

        let result = binding
            .result
            .apply(&output)
            .map_err(|e| ToolError::adapter(&tool_name, e.to_string()))?;
        let sidecar = binding
            .sidecar
            .as_ref()
            .map(|adapter| adapter.apply(&output))
            .transpose()
            .map_err(|e| ToolError::adapter(&tool_name, e.to_string()))?;

        Ok(ToolOutput { result, sidecar })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CallId, RunId};
    use serde::Deserialize;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    #[derive(Debug, Deserialize, JsonSchema)]
    struct ListInput {
        #[serde(default)]
        limit: Option<u32>,
    }

    #[derive(Debug, Serialize, JsonSchema)]
    struct ListOutput {
        items: Vec<String>,
        total: u64,
        evidence: Vec<String>,
    }

    struct ListTodos;

    #[async_trait]
    impl ServiceMethod for ListTodos {
        type Input = ListInput;
        type Output = ListOutput;

        const SERVICE: &'static str = "todo";
        const METHOD: &'static str = "List";

        async fn call(
            &self,
            input: ListInput,
            _ctx: &InvocationContext,
        ) -> Result<ListOutput, MethodError> {
            let limit = input.limit.unwrap_or(2) as usize;
            let all = ["a", "b", "c"];
            Ok(ListOutput {
                items: all.iter().take(limit).map(|s| s.to_string()).collect(),
                total: all.len() as u64,
                evidence: vec!["db".into()],
            })
        }
    }

    fn ctx() -> InvocationContext {
        InvocationContext::new(RunId::from("r"), CallId::from("c"), CancellationToken::new())
    }

    #[tokio::test]
    async fn bounded_results_strip_evidence_and_gain_bounds() {
        let definition = ListTodos::tool("todos", "list").bounded();
        let mut backend = MethodBackend::new();
        backend.register(definition.clone(), ListTodos).unwrap();

        let output = backend
            .invoke(&definition, json!({}), &ctx())
            .await
            .unwrap();
        assert_eq!(output.result["items"], json!(["a", "b"]));
        assert!(output.result.get("evidence").is_none());
        assert_eq!(output.result["bounds"]["returned"], json!(2));
        assert_eq!(output.result["bounds"]["total"], json!(3));
        assert_eq!(output.result["bounds"]["truncated"], json!(true));
    }

    #[tokio::test]
    async fn sidecar_wraps_the_service_result() {
        let sidecar = json!({
            "type": "object",
            "properties": {"listing": schema_for::<ListOutput>()},
            "required": ["listing"]
        });
        let definition = ListTodos::tool("todos", "list")
            .with_sidecar(TypedSchema::new("ListSidecar", sidecar));
        let mut backend = MethodBackend::new();
        backend.register(definition.clone(), ListTodos).unwrap();

        let output = backend
            .invoke(&definition, json!({"limit": 1}), &ctx())
            .await
            .unwrap();
        let sidecar = output.sidecar.unwrap();
        assert_eq!(sidecar["listing"]["items"], json!(["a"]));
        assert_eq!(sidecar["listing"]["evidence"], json!(["db"]));
    }

    #[test]
    fn refuses_divergent_payload_shapes() {
        let definition = ListTodos::tool("todos", "list").with_result(TypedSchema::new(
            "Other",
            json!({
                "type": "object",
                "properties": {"missing": {"type": "string"}},
                "required": ["missing"]
            }),
        ));
        let mut backend = MethodBackend::new();
        let err = backend.register(definition, ListTodos).unwrap_err();
        assert!(matches!(err, CatalogError::Adapter { .. }));
        assert!(backend.definitions().is_empty());
    }
}
