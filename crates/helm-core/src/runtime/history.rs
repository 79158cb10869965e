use std::collections::HashSet;

use crate::api::{Message, ToolNameMap};
use crate::events::{EventRecord, RunEvent};

/// Conversation history for the next model call, built from a window of the
/// run's log. Tool names are presented under their sanitized form; a result
/// whose call fell outside the window is dropped so the provider never sees
/// an unmatched result.
pub fn build_history(records: &[EventRecord], names: &ToolNameMap) -> Vec<Message> {
    let present = |name: &str| names.sanitized(name).unwrap_or(name).to_string();
    let mut calls = HashSet::new();
    let mut messages = Vec::with_capacity(records.len());

    for record in records {
        match &record.event {
            RunEvent::UserMessage { text } => {
                messages.push(Message::User { text: text.clone() });
            }
            RunEvent::AssistantMessage { text } if !text.is_empty() => {
                messages.push(Message::Assistant { text: text.clone() });
            }
            RunEvent::ToolCall {
                call_id,
                tool_name,
                payload,
            } => {
                calls.insert(call_id);
                messages.push(Message::ToolCall {
                    call_id: call_id.clone(),
                    tool_name: present(tool_name),
                    payload: payload.clone(),
                });
            }
            RunEvent::ToolResult {
                call_id,
                tool_name,
                result_code,
                result,
                ..
            } if calls.contains(call_id) => {
                messages.push(Message::ToolResult {
                    call_id: call_id.clone(),
                    tool_name: present(tool_name),
                    result_code: *result_code,
                    result: result.clone(),
                });
            }
            _ => {}
        }
    }
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CallId, EventId, RunId};
    use chrono::Utc;
    use helm_tools::ResultCode;
    use serde_json::json;

    fn record(sequence: u64, event: RunEvent) -> EventRecord {
        EventRecord {
            sequence,
            event_id: EventId::new(),
            run_id: RunId::from("r"),
            occurred_at: Utc::now(),
            event,
        }
    }

    #[test]
    fn history_skips_chunks_and_sanitizes_names() {
        let names = ToolNameMap::new(["orders.cancel", "todos.list"]);
        let records = vec![
            record(1, RunEvent::UserMessage { text: "hi".into() }),
            record(2, RunEvent::AssistantChunk { text: "x".into() }),
            record(
                3,
                RunEvent::ToolCall {
                    call_id: CallId::from("c1"),
                    tool_name: "orders.cancel".into(),
                    payload: json!({"orderId": "o1"}),
                },
            ),
            record(
                4,
                RunEvent::ToolResult {
                    call_id: CallId::from("c1"),
                    tool_name: "orders.cancel".into(),
                    result_code: ResultCode::Ok,
                    result: json!({"ok": true}),
                    sidecar: Some(json!({"audit": 1})),
                },
            ),
        ];
        let history = build_history(&records, &names);
        assert_eq!(history.len(), 3);
        assert!(matches!(
            &history[1],
            Message::ToolCall { tool_name, .. } if tool_name == "cancel"
        ));
    }

    #[test]
    fn results_without_their_call_are_dropped() {
        let names = ToolNameMap::new(["todos.list"]);
        let records = vec![record(
            9,
            RunEvent::ToolResult {
                call_id: CallId::from("c0"),
                tool_name: "todos.list".into(),
                result_code: ResultCode::Ok,
                result: json!({}),
                sidecar: None,
            },
        )];
        assert!(build_history(&records, &names).is_empty());
    }
}
