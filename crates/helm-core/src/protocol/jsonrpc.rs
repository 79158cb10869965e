//! JSON-RPC 2.0 surface over the run engine and tool catalog.
//!
//! Requests without an `id` are notifications: they are executed but never
//! answered. Streamed run events leave through the notification channel
//! returned by [`RpcDispatcher::new`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::events::{EventCursor, ResumeDecision};
use crate::runtime::{EngineError, RunEngine};
use crate::tools::InvocationContext;
use crate::types::{CallId, RunId};
use helm_tools::{ErrorKind, ToolDefinition, ToolError};

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2025-06-18";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

const RESOURCE_SCHEME: &str = "run://";
const RESOURCE_SUFFIX: &str = "/events";
const READ_PAGE: usize = 256;

/// Application range code for a domain error kind.
pub fn domain_code(kind: ErrorKind) -> i64 {
    match kind {
        ErrorKind::NotFound => -32001,
        ErrorKind::Invalid => -32002,
        ErrorKind::Conflict => -32003,
        ErrorKind::Transient => -32004,
        ErrorKind::Permanent => -32005,
        ErrorKind::Canceled => -32006,
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    /// Domain failure carrying its kind in `data`.
    pub fn domain(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            code: domain_code(kind),
            message: message.into(),
            data: Some(json!({ "kind": kind })),
        }
    }
}

impl From<EngineError> for RpcError {
    fn from(error: EngineError) -> Self {
        RpcError::domain(error.kind(), error.to_string())
    }
}

impl From<ToolError> for RpcError {
    fn from(error: ToolError) -> Self {
        match error {
            ToolError::UnknownTool { .. } => RpcError {
                code: METHOD_NOT_FOUND,
                message: error.to_string(),
                data: Some(json!({ "kind": error.kind() })),
            },
            ToolError::InvalidPayload { .. } => RpcError {
                code: INVALID_PARAMS,
                message: error.to_string(),
                data: Some(json!({ "kind": error.kind() })),
            },
            _ => RpcError {
                code: domain_code(error.kind()),
                message: error.to_string(),
                data: Some(json!({
                    "kind": error.kind(),
                    "result_code": error.result_code(),
                })),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Server-initiated message; carries streamed run events.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    pub params: Value,
}

impl RpcNotification {
    fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method: method.into(),
            params,
        }
    }
}

/// How a forwarded event is wrapped for the client.
#[derive(Debug, Clone, Copy)]
enum SubscriptionKind {
    Run,
    Resource,
}

impl SubscriptionKind {
    fn method(self) -> &'static str {
        match self {
            SubscriptionKind::Run => "notifications/run/event",
            SubscriptionKind::Resource => "notifications/resources/updated",
        }
    }
}

struct ActiveSubscription {
    generation: u64,
    cancel: CancellationToken,
}

type SubscriptionMap = Arc<Mutex<HashMap<String, ActiveSubscription>>>;

#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
    #[serde(default)]
    meta: Option<CallMeta>,
}

#[derive(Debug, Default, Deserialize)]
struct CallMeta {
    #[serde(default)]
    run_id: Option<RunId>,
    #[serde(default)]
    call_id: Option<CallId>,
}

#[derive(Debug, Deserialize)]
struct UriParams {
    uri: String,
    #[serde(default)]
    cursor: Option<u64>,
    #[serde(default)]
    last_event_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RunParams {
    run_id: RunId,
    #[serde(default)]
    last_event_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct PromptParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ClientStatus {
    Paused,
    Running,
    #[serde(alias = "cancelled")]
    Canceled,
}

#[derive(Debug, Deserialize)]
struct StatusUpdateParams {
    run_id: RunId,
    status: ClientStatus,
    #[serde(default)]
    decision: Option<ResumeDecision>,
    #[serde(default)]
    reason: Option<String>,
}

/// Routes JSON-RPC requests to the engine, executor and bus.
pub struct RpcDispatcher {
    engine: RunEngine,
    subscriptions: SubscriptionMap,
    next_generation: AtomicU64,
    notify_tx: mpsc::UnboundedSender<RpcNotification>,
}

impl RpcDispatcher {
    pub fn new(engine: RunEngine) -> (Self, mpsc::UnboundedReceiver<RpcNotification>) {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            engine,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
            notify_tx,
        };
        (dispatcher, notify_rx)
    }

    /// Number of live event subscriptions.
    pub fn subscription_count(&self) -> usize {
        lock(&self.subscriptions).len()
    }

    /// Decode, dispatch and encode one message. `None` for notifications.
    pub async fn handle_text(&self, text: &str) -> Option<String> {
        let response = match serde_json::from_str::<Value>(text) {
            Ok(message) => self.handle(message).await?,
            Err(e) => RpcResponse::failure(
                Value::Null,
                RpcError::new(PARSE_ERROR, format!("Parse error: {e}")),
            ),
        };
        match serde_json::to_string(&response) {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(target: "helm::api", error = %e, "Failed to encode JSON-RPC response");
                None
            }
        }
    }

    pub async fn handle(&self, message: Value) -> Option<RpcResponse> {
        let id = message.get("id").cloned();
        let request: RpcRequest = match serde_json::from_value(message) {
            Ok(request) => request,
            Err(e) => {
                return Some(RpcResponse::failure(
                    id.unwrap_or(Value::Null),
                    RpcError::new(INVALID_REQUEST, format!("Invalid request: {e}")),
                ));
            }
        };

        if request.jsonrpc.as_deref() != Some(JSONRPC_VERSION) {
            return request.id.map(|id| {
                RpcResponse::failure(
                    id,
                    RpcError::new(INVALID_REQUEST, "jsonrpc must be \"2.0\""),
                )
            });
        }

        debug!(
            target: "helm::api",
            method = %request.method,
            notification = request.id.is_none(),
            "JSON-RPC request"
        );
        let outcome = self.dispatch(&request.method, request.params).await;
        let id = request.id?;
        Some(match outcome {
            Ok(result) => RpcResponse::success(id, result),
            Err(error) => RpcResponse::failure(id, error),
        })
    }

    async fn dispatch(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "initialize" => Ok(self.initialize()),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(self.list_tools()),
            "tools/call" => self.call_tool(parse_params(params)?).await,
            "resources/list" => self.list_resources().await,
            "resources/read" => self.read_resource(parse_params(params)?).await,
            "resources/subscribe" => {
                let params: UriParams = parse_params(params)?;
                let run_id = run_from_uri(&params.uri)?;
                Ok(self.subscribe(
                    params.uri,
                    run_id,
                    params.last_event_id,
                    SubscriptionKind::Resource,
                ))
            }
            "resources/unsubscribe" => {
                let params: UriParams = parse_params(params)?;
                Ok(json!({ "unsubscribed": self.unsubscribe(&params.uri) }))
            }
            "subscribe" => {
                let params: RunParams = parse_params(params)?;
                let key = params.run_id.to_string();
                Ok(self.subscribe(
                    key,
                    params.run_id,
                    params.last_event_id,
                    SubscriptionKind::Run,
                ))
            }
            "unsubscribe" => {
                let params: RunParams = parse_params(params)?;
                Ok(json!({ "unsubscribed": self.unsubscribe(params.run_id.as_str()) }))
            }
            "prompts/list" => Ok(self.list_prompts()),
            "prompts/get" => self.get_prompt(parse_params(params)?),
            "notify_status_update" => self.status_update(parse_params(params)?).await,
            other => Err(RpcError::method_not_found(other)),
        }
    }

    fn initialize(&self) -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "serverInfo": {
                "name": "helm",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {
                "tools": { "listChanged": false },
                "resources": { "subscribe": true, "listChanged": false },
                "prompts": { "listChanged": false },
            },
        })
    }

    fn list_tools(&self) -> Value {
        let tools: Vec<Value> = self
            .engine
            .executor()
            .catalog()
            .list()
            .iter()
            .map(tool_descriptor)
            .collect();
        json!({ "tools": tools })
    }

    async fn call_tool(&self, params: CallParams) -> Result<Value, RpcError> {
        let meta = params.meta.unwrap_or_default();
        let run_id = meta.run_id.unwrap_or_else(RunId::generate);
        let call_id = meta
            .call_id
            .unwrap_or_else(|| CallId::new(format!("rpc-{}", Uuid::new_v4())));
        let ctx = InvocationContext::new(run_id, call_id, CancellationToken::new());
        let arguments = match params.arguments {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };

        let output = self
            .engine
            .executor()
            .invoke(&params.name, arguments, &ctx)
            .await?;
        let text = output.result.to_string();
        let mut result = json!({
            "content": [{ "type": "text", "text": text }],
            "structuredContent": output.result,
            "isError": false,
        });
        if let Some(sidecar) = output.sidecar {
            result["sidecar"] = sidecar;
        }
        Ok(result)
    }

    async fn list_resources(&self) -> Result<Value, RpcError> {
        let resources: Vec<Value> = self
            .engine
            .active_runs()
            .await?
            .into_iter()
            .map(|run_id| {
                json!({
                    "uri": run_uri(&run_id),
                    "name": run_id,
                    "mimeType": "application/json",
                })
            })
            .collect();
        Ok(json!({ "resources": resources }))
    }

    async fn read_resource(&self, params: UriParams) -> Result<Value, RpcError> {
        let run_id = run_from_uri(&params.uri)?;
        let page = self
            .engine
            .log()
            .scan(&run_id, params.cursor.map(EventCursor::after), READ_PAGE)
            .await
            .map_err(|e| RpcError::domain(e.kind(), e.to_string()))?;
        let text = serde_json::to_string(&page.events)
            .map_err(|e| RpcError::new(INTERNAL_ERROR, e.to_string()))?;
        Ok(json!({
            "contents": [{
                "uri": params.uri,
                "mimeType": "application/json",
                "text": text,
            }],
            "nextCursor": page.next_cursor.map(|cursor| cursor.sequence),
        }))
    }

    /// Replaces any earlier subscription under the same key.
    fn subscribe(
        &self,
        key: String,
        run_id: RunId,
        last_event_id: Option<u64>,
        kind: SubscriptionKind,
    ) -> Value {
        let cancel = CancellationToken::new();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        if let Some(previous) = lock(&self.subscriptions).insert(
            key.clone(),
            ActiveSubscription {
                generation,
                cancel: cancel.clone(),
            },
        ) {
            previous.cancel.cancel();
        }

        let subscription = self.engine.subscribe(
            &run_id,
            last_event_id.map(EventCursor::after),
            cancel.clone(),
        );
        let notify_tx = self.notify_tx.clone();
        let subscriptions = Arc::clone(&self.subscriptions);
        let forward_key = key.clone();
        tokio::spawn(async move {
            let mut events = Box::pin(subscription.into_stream());
            while let Some(item) = events.next().await {
                let params = match item {
                    Ok(record) => match kind {
                        SubscriptionKind::Run => json!({ "run_id": run_id, "event": record }),
                        SubscriptionKind::Resource => {
                            json!({ "uri": forward_key, "event": record })
                        }
                    },
                    Err(e) => {
                        warn!(
                            target: "helm::api",
                            run_id = %run_id,
                            error = %e,
                            "Event subscription ended"
                        );
                        let _ = notify_tx.send(RpcNotification::new(
                            kind.method(),
                            json!({
                                "run_id": run_id,
                                "error": { "kind": e.kind(), "message": e.to_string() },
                            }),
                        ));
                        break;
                    }
                };
                if notify_tx.send(RpcNotification::new(kind.method(), params)).is_err() {
                    cancel.cancel();
                    break;
                }
            }
            let mut active = lock(&subscriptions);
            if active
                .get(&forward_key)
                .is_some_and(|entry| entry.generation == generation)
            {
                active.remove(&forward_key);
            }
        });

        json!({ "subscription": key })
    }

    fn unsubscribe(&self, key: &str) -> bool {
        match lock(&self.subscriptions).remove(key) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn list_prompts(&self) -> Value {
        let prompts: Vec<Value> = self
            .engine
            .executor()
            .catalog()
            .list()
            .iter()
            .filter_map(|definition| {
                let confirmation = definition.confirmation.as_ref()?;
                Some(json!({
                    "name": definition.qualified_name(),
                    "title": confirmation.title,
                    "description": definition.description,
                    "arguments": prompt_arguments(&definition.payload_schema()),
                }))
            })
            .collect();
        json!({ "prompts": prompts })
    }

    fn get_prompt(&self, params: PromptParams) -> Result<Value, RpcError> {
        let entry = self.engine.executor().resolve(&params.name)?;
        let confirmation = entry.definition.confirmation.as_ref().ok_or_else(|| {
            RpcError::invalid_params(format!("Tool {} has no confirmation prompt", params.name))
        })?;
        let text = confirmation
            .render_prompt(&params.arguments)
            .map_err(|e| RpcError::domain(ErrorKind::Invalid, e.to_string()))?;
        Ok(json!({
            "description": confirmation.title,
            "messages": [{
                "role": "user",
                "content": { "type": "text", "text": text },
            }],
        }))
    }

    async fn status_update(&self, params: StatusUpdateParams) -> Result<Value, RpcError> {
        match params.status {
            ClientStatus::Paused => self.engine.pause(&params.run_id).await?,
            ClientStatus::Running => {
                let decision = params.decision.unwrap_or(ResumeDecision::Accept);
                self.engine.resume(&params.run_id, decision).await?;
            }
            ClientStatus::Canceled => self.engine.cancel(&params.run_id, params.reason).await?,
        }
        Ok(json!({}))
    }
}

impl Drop for RpcDispatcher {
    fn drop(&mut self) {
        for (_, entry) in lock(&self.subscriptions).drain() {
            entry.cancel.cancel();
        }
    }
}

fn lock(map: &SubscriptionMap) -> MutexGuard<'_, HashMap<String, ActiveSubscription>> {
    match map.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    let params = match params {
        Value::Null => Value::Object(Map::new()),
        other => other,
    };
    serde_json::from_value(params).map_err(|e| RpcError::invalid_params(e.to_string()))
}

pub fn run_uri(run_id: &RunId) -> String {
    format!("{RESOURCE_SCHEME}{run_id}{RESOURCE_SUFFIX}")
}

/// Run id from a `run://<run_id>/events` resource URI.
pub fn run_from_uri(uri: &str) -> Result<RunId, RpcError> {
    uri.strip_prefix(RESOURCE_SCHEME)
        .and_then(|rest| rest.strip_suffix(RESOURCE_SUFFIX))
        .filter(|run_id| !run_id.is_empty() && !run_id.contains('/'))
        .map(RunId::from)
        .ok_or_else(|| RpcError::invalid_params(format!("Unknown resource URI: {uri}")))
}

fn tool_descriptor(definition: &ToolDefinition) -> Value {
    json!({
        "name": definition.qualified_name(),
        "title": definition.title,
        "description": definition.description,
        "inputSchema": definition.payload_schema(),
    })
}

fn prompt_arguments(schema: &Value) -> Vec<Value> {
    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    schema
        .get("properties")
        .and_then(Value::as_object)
        .map(|properties| {
            properties
                .iter()
                .map(|(name, property)| {
                    json!({
                        "name": name,
                        "description": property
                            .get("description")
                            .cloned()
                            .unwrap_or(Value::Null),
                        "required": required.contains(&name.as_str()),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::RunStatus;
    use crate::test_utils::{ScriptedModelClient, TestEngine, order_catalog};
    use std::time::Duration;

    fn dispatcher(
        model: ScriptedModelClient,
    ) -> (
        TestEngine,
        RpcDispatcher,
        mpsc::UnboundedReceiver<RpcNotification>,
    ) {
        let harness = TestEngine::new(order_catalog(), model);
        let (dispatcher, notifications) = RpcDispatcher::new(harness.engine.clone());
        (harness, dispatcher, notifications)
    }

    async fn call(dispatcher: &RpcDispatcher, method: &str, params: Value) -> RpcResponse {
        dispatcher
            .handle(json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params }))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn notifications_get_no_response() {
        let (_harness, dispatcher, _rx) = dispatcher(ScriptedModelClient::default());
        let response = dispatcher
            .handle(json!({ "jsonrpc": "2.0", "method": "ping" }))
            .await;
        assert!(response.is_none());
        assert!(
            dispatcher
                .handle_text(r#"{"jsonrpc":"2.0","method":"nope"}"#)
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn malformed_messages_map_to_standard_codes() {
        let (_harness, dispatcher, _rx) = dispatcher(ScriptedModelClient::default());

        let text = dispatcher.handle_text("{not json").await.unwrap();
        let response: RpcResponse = serde_json::from_str(&text).unwrap();
        assert_eq!(response.error.unwrap().code, PARSE_ERROR);

        let response = call(&dispatcher, "does/not/exist", Value::Null).await;
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);

        let response = dispatcher
            .handle(json!({ "jsonrpc": "1.0", "id": 7, "method": "ping" }))
            .await
            .unwrap();
        assert_eq!(response.id, json!(7));
        assert_eq!(response.error.unwrap().code, INVALID_REQUEST);
    }

    #[tokio::test]
    async fn lists_tools_with_qualified_names() {
        let (_harness, dispatcher, _rx) = dispatcher(ScriptedModelClient::default());
        let response = call(&dispatcher, "tools/list", json!({})).await;
        let tools = response.result.unwrap()["tools"].clone();
        let names: Vec<&str> = tools
            .as_array()
            .unwrap()
            .iter()
            .map(|tool| tool["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"orders.cancel"));
        assert_eq!(tools[0]["inputSchema"]["type"], "object");
    }

    #[tokio::test]
    async fn tool_call_errors_use_rpc_codes() {
        let (_harness, dispatcher, _rx) = dispatcher(ScriptedModelClient::default());

        let response = call(
            &dispatcher,
            "tools/call",
            json!({ "name": "orders.refund", "arguments": {} }),
        )
        .await;
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);

        let response = call(
            &dispatcher,
            "tools/call",
            json!({ "name": "orders.cancel", "arguments": { "orderId": 42 } }),
        )
        .await;
        let error = response.error.unwrap();
        assert_eq!(error.code, INVALID_PARAMS);
        assert_eq!(error.data.unwrap()["kind"], "invalid");
    }

    #[tokio::test]
    async fn tool_call_returns_structured_content() {
        let (_harness, dispatcher, _rx) = dispatcher(ScriptedModelClient::default());
        let response = call(
            &dispatcher,
            "tools/call",
            json!({ "name": "orders.cancel", "arguments": { "orderId": "o-1" } }),
        )
        .await;
        let result = response.result.unwrap();
        assert_eq!(result["isError"], false);
        assert_eq!(result["structuredContent"]["orderId"], "o-1");
    }

    #[tokio::test]
    async fn prompts_render_confirmation_templates() {
        let (_harness, dispatcher, _rx) = dispatcher(ScriptedModelClient::default());

        let listed = call(&dispatcher, "prompts/list", json!({})).await.result.unwrap();
        assert_eq!(listed["prompts"][0]["name"], "orders.cancel");
        assert_eq!(listed["prompts"][0]["arguments"][0]["name"], "orderId");

        let prompt = call(
            &dispatcher,
            "prompts/get",
            json!({ "name": "orders.cancel", "arguments": { "orderId": "o-9" } }),
        )
        .await
        .result
        .unwrap();
        assert_eq!(prompt["messages"][0]["content"]["text"], "Cancel order o-9?");
    }

    #[tokio::test]
    async fn resource_uris_round_trip() {
        let run_id = RunId::from("r-1");
        assert_eq!(run_from_uri(&run_uri(&run_id)).unwrap(), run_id);
        assert_eq!(
            run_from_uri("run:///events").unwrap_err().code,
            INVALID_PARAMS
        );
        assert!(run_from_uri("file://r-1/events").is_err());
    }

    #[tokio::test]
    async fn status_updates_drive_the_engine() {
        let (harness, dispatcher, _rx) = dispatcher(ScriptedModelClient::pending());
        let run_id = harness.submit("s1", "hello").await.unwrap();

        let response = call(
            &dispatcher,
            "notify_status_update",
            json!({ "run_id": run_id, "status": "cancelled", "reason": "user" }),
        )
        .await;
        assert!(response.error.is_none());
        let status = tokio::time::timeout(Duration::from_secs(5), harness.engine.wait(&run_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, RunStatus::Canceled);

        let response = call(
            &dispatcher,
            "notify_status_update",
            json!({ "run_id": run_id, "status": "finished" }),
        )
        .await;
        assert_eq!(response.error.unwrap().code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn subscriptions_forward_events_until_terminal() {
        let (harness, dispatcher, mut notifications) =
            dispatcher(ScriptedModelClient::default().with_text(["Hi", " there"]));
        let run_id = harness.submit("s1", "hello").await.unwrap();
        let status = harness.engine.wait(&run_id).await.unwrap();
        assert_eq!(status, RunStatus::Completed);

        let response = call(
            &dispatcher,
            "subscribe",
            json!({ "run_id": run_id, "last_event_id": 0 }),
        )
        .await;
        assert!(response.error.is_none());

        let mut types = Vec::new();
        while let Some(notification) =
            tokio::time::timeout(Duration::from_secs(5), notifications.recv())
                .await
                .unwrap()
        {
            assert_eq!(notification.method, "notifications/run/event");
            let event_type = notification.params["event"]["event"]["type"]
                .as_str()
                .unwrap()
                .to_string();
            let done = event_type == "terminal";
            types.push(event_type);
            if done {
                break;
            }
        }
        assert_eq!(types.first().map(String::as_str), Some("user_message"));
        assert_eq!(types.last().map(String::as_str), Some("terminal"));
    }
}
