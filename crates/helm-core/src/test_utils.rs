//! Test utilities for helm-core
//!
//! Scripted model and tool backends plus an in-memory engine harness, shared
//! by unit tests and the integration tests under `tests/`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::api::{
    ApiError, GenerateContext, GenerateResult, Message, ModelClient, StopReason, ToolCallRequest,
    ToolChoice, ToolSpec,
};
use crate::bus::EventBus;
use crate::config::{BusConfig, EngineConfig};
use crate::events::{EventLog, EventLogError, EventRecord};
use crate::retry::RetryPolicy;
use crate::runtime::{EngineDeps, EngineError, RunEngine, SubmitRequest};
use crate::session::{InMemoryStore, SessionStore};
use crate::tools::{
    InvocationContext, MethodBackend, MethodError, ServiceMethod, ToolBackend, ToolCatalog,
    ToolExecutor, ToolOutput,
};
use crate::types::{AgentId, CallId, RunId, SessionId};
use helm_tools::{
    ConfirmationPolicy, ExecutionPolicy, ToolDefinition, ToolError, ToolId, ToolProvider,
    TypedSchema,
};

/// One scripted answer to a `generate` call.
#[derive(Debug, Clone)]
pub enum ScriptedTurn {
    Text(Vec<String>),
    /// Streams the chunks, then never finishes.
    Hang(Vec<String>),
    ToolCalls(Vec<ToolCallRequest>),
    Stop(StopReason),
    Fail(ApiError),
}

/// Model client that replays a fixed script. Once the script runs out every
/// call answers with `Done`.
#[derive(Default)]
pub struct ScriptedModelClient {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    histories: Mutex<Vec<Vec<Message>>>,
    tools: Mutex<Vec<Vec<ToolSpec>>>,
}

impl ScriptedModelClient {
    pub fn new(turns: impl IntoIterator<Item = ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Streams one chunk and then hangs until canceled.
    pub fn pending() -> Self {
        Self::new([ScriptedTurn::Hang(vec!["Thinking".to_string()])])
    }

    pub fn with_turn(self, turn: ScriptedTurn) -> Self {
        self.turns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(turn);
        self
    }

    pub fn with_text<I, S>(self, chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_turn(ScriptedTurn::Text(
            chunks.into_iter().map(Into::into).collect(),
        ))
    }

    pub fn with_tool_call(self, call_id: &str, tool_name: &str, payload: Value) -> Self {
        self.with_turn(ScriptedTurn::ToolCalls(vec![ToolCallRequest {
            call_id: CallId::from(call_id),
            tool_name: tool_name.to_string(),
            payload,
        }]))
    }

    /// Number of `generate` calls served so far.
    pub fn calls(&self) -> usize {
        self.histories
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// History passed to each `generate` call, in call order.
    pub fn histories(&self) -> Vec<Vec<Message>> {
        self.histories
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Tool specs advertised on the most recent call.
    pub fn last_tools(&self) -> Vec<ToolSpec> {
        self.tools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ModelClient for ScriptedModelClient {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        _ctx: &GenerateContext,
        history: &[Message],
        tools: &[ToolSpec],
        _tool_choice: ToolChoice,
    ) -> Result<GenerateResult, ApiError> {
        self.histories
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(history.to_vec());
        self.tools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tools.to_vec());
        let turn = self
            .turns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| ScriptedTurn::Text(vec!["Done".to_string()]));

        match turn {
            ScriptedTurn::Text(chunks) => Ok(GenerateResult::Text(Box::pin(
                futures::stream::iter(chunks.into_iter().map(Ok)),
            ))),
            ScriptedTurn::Hang(chunks) => Ok(GenerateResult::Text(Box::pin(
                futures::stream::iter(chunks.into_iter().map(Ok))
                    .chain(futures::stream::pending()),
            ))),
            ScriptedTurn::ToolCalls(calls) => Ok(GenerateResult::ToolCalls(calls)),
            ScriptedTurn::Stop(reason) => Ok(GenerateResult::Stop(reason)),
            ScriptedTurn::Fail(error) => Err(error),
        }
    }
}

/// Returns the payload as the result and counts invocations.
#[derive(Default)]
pub struct EchoBackend {
    calls: AtomicUsize,
}

impl EchoBackend {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolBackend for EchoBackend {
    fn name(&self) -> &str {
        "echo"
    }

    async fn invoke(
        &self,
        _definition: &ToolDefinition,
        payload: Value,
        _ctx: &InvocationContext,
    ) -> Result<ToolOutput, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ToolOutput::new(payload))
    }
}

/// Fails with a retryable error a fixed number of times, then echoes.
pub struct FlakyBackend {
    failures: usize,
    calls: AtomicUsize,
}

impl FlakyBackend {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolBackend for FlakyBackend {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn invoke(
        &self,
        definition: &ToolDefinition,
        payload: Value,
        _ctx: &InvocationContext,
    ) -> Result<ToolOutput, ToolError> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(ToolError::retryable(
                definition.qualified_name(),
                "upstream unavailable",
            ));
        }
        Ok(ToolOutput::new(payload))
    }
}

/// Holds every call for `delay` and records the most calls in flight at
/// once.
pub struct ConcurrencyBackend {
    delay: Duration,
    current: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl ConcurrencyBackend {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolBackend for ConcurrencyBackend {
    fn name(&self) -> &str {
        "concurrency"
    }

    async fn invoke(
        &self,
        _definition: &ToolDefinition,
        payload: Value,
        _ctx: &InvocationContext,
    ) -> Result<ToolOutput, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(ToolOutput::new(payload))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListTodosInput {}

#[derive(Debug, Serialize, JsonSchema)]
pub struct ListTodosOutput {
    pub items: Vec<String>,
}

/// `todo.List`: always an empty list.
pub struct TodoService;

#[async_trait]
impl ServiceMethod for TodoService {
    type Input = ListTodosInput;
    type Output = ListTodosOutput;

    const SERVICE: &'static str = "todo";
    const METHOD: &'static str = "List";

    async fn call(
        &self,
        _input: ListTodosInput,
        _ctx: &InvocationContext,
    ) -> Result<ListTodosOutput, MethodError> {
        Ok(ListTodosOutput { items: Vec::new() })
    }
}

/// Catalog with the method-backed, idempotent `todos.list`.
pub fn todo_catalog() -> Arc<ToolCatalog> {
    let catalog = Arc::new(ToolCatalog::new());
    let mut backend = MethodBackend::new();
    let definition = TodoService::tool("todos", "list")
        .with_title("List todos")
        .with_policy(ExecutionPolicy {
            idempotent: true,
            serial: false,
        });
    if let Err(e) = backend.register(definition, TodoService) {
        tracing::error!(error = %e, "todos.list failed to register");
        return catalog;
    }
    let definitions = backend.definitions();
    if let Err(e) = catalog.publish_toolset("todos", definitions, Arc::new(backend)) {
        tracing::error!(error = %e, "todos toolset failed to publish");
    }
    catalog
}

/// `orders.cancel` with a confirmation whose denied result is
/// `denied_template`.
pub fn order_definition(denied_template: &str) -> ToolDefinition {
    ToolDefinition::new(
        ToolId::new("orders", "cancel"),
        ToolProvider::MethodBacked {
            service: "orders".to_string(),
            method: "Cancel".to_string(),
        },
    )
    .with_title("Cancel order")
    .with_description("Cancel an open order")
    .with_payload(TypedSchema::new(
        "CancelOrderInput",
        json!({
            "type": "object",
            "properties": {
                "orderId": {"type": "string", "description": "Order to cancel"}
            },
            "required": ["orderId"]
        }),
    ))
    .with_confirmation(ConfirmationPolicy::new(
        "Cancel order",
        "Cancel order {{orderId}}?",
        denied_template,
    ))
}

/// Catalog with the confirmed `orders.cancel`, served by an [`EchoBackend`].
pub fn order_catalog() -> Arc<ToolCatalog> {
    order_catalog_with(order_definition("Order {{orderId}} was not cancelled"))
}

pub fn order_catalog_with(definition: ToolDefinition) -> Arc<ToolCatalog> {
    let catalog = Arc::new(ToolCatalog::new());
    if let Err(e) =
        catalog.publish_toolset("orders", vec![definition], Arc::new(EchoBackend::default()))
    {
        tracing::error!(error = %e, "orders toolset failed to publish");
    }
    catalog
}

/// Engine over an [`InMemoryStore`] with short drain and lease timings.
pub struct TestEngine {
    pub engine: RunEngine,
    pub store: Arc<InMemoryStore>,
    pub model: Arc<ScriptedModelClient>,
}

impl TestEngine {
    pub fn new(catalog: Arc<ToolCatalog>, model: ScriptedModelClient) -> Self {
        Self::with_store(Arc::new(InMemoryStore::new()), catalog, model)
    }

    pub fn with_store(
        store: Arc<InMemoryStore>,
        catalog: Arc<ToolCatalog>,
        model: ScriptedModelClient,
    ) -> Self {
        Self::build(store, catalog, model, test_engine_config())
    }

    pub fn with_config(
        catalog: Arc<ToolCatalog>,
        model: ScriptedModelClient,
        config: EngineConfig,
    ) -> Self {
        Self::build(Arc::new(InMemoryStore::new()), catalog, model, config)
    }

    fn build(
        store: Arc<InMemoryStore>,
        catalog: Arc<ToolCatalog>,
        model: ScriptedModelClient,
        config: EngineConfig,
    ) -> Self {
        let model = Arc::new(model);
        let deps = engine_deps(store.clone(), store.clone(), catalog, model.clone(), config);
        Self {
            engine: RunEngine::spawn(deps),
            store,
            model,
        }
    }

    pub async fn submit(&self, session_id: &str, message: &str) -> Result<RunId, EngineError> {
        self.engine
            .submit(SubmitRequest::new(
                SessionId::from(session_id),
                AgentId::from("a"),
                message,
            ))
            .await
    }

    /// Every logged event of the run.
    pub async fn events(&self, run_id: &RunId) -> Result<Vec<EventRecord>, EventLogError> {
        all_events(self.store.as_ref(), run_id).await
    }
}

pub fn test_engine_config() -> EngineConfig {
    EngineConfig {
        drain_window_secs: 1,
        lease_ttl_secs: 2,
        ..EngineConfig::default()
    }
}

/// Engine dependencies with tool and model retries that back off in
/// milliseconds.
pub fn engine_deps(
    store: Arc<dyn SessionStore>,
    log: Arc<dyn EventLog>,
    catalog: Arc<ToolCatalog>,
    model: Arc<dyn ModelClient>,
    config: EngineConfig,
) -> EngineDeps {
    let bus = EventBus::new(log.clone(), BusConfig::default());
    EngineDeps::new(store, log, ToolExecutor::new(catalog), model, bus)
        .with_config(config)
        .with_tool_retry(fast_retry())
        .with_model_retry(fast_retry())
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    }
}

pub async fn all_events<L: EventLog + ?Sized>(
    log: &L,
    run_id: &RunId,
) -> Result<Vec<EventRecord>, EventLogError> {
    let mut events = Vec::new();
    let mut cursor = None;
    loop {
        let page = log.scan(run_id, cursor, 256).await?;
        events.extend(page.events);
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => return Ok(events),
        }
    }
}
