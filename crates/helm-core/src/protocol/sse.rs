//! Server-sent event framing of run events.

use futures::{Stream, StreamExt};
use serde_json::json;
use tracing::warn;

use crate::bus::Subscription;
use crate::events::{EventCursor, EventLogError, EventRecord, EventType};
use helm_tools::ErrorKind;

pub const LAST_EVENT_ID_HEADER: &str = "Last-Event-ID";

/// Event name on the wire. User and assistant text share `message`.
pub fn sse_event_name(event_type: EventType) -> &'static str {
    match event_type {
        EventType::UserMessage | EventType::AssistantChunk | EventType::AssistantMessage => {
            "message"
        }
        EventType::ToolCall => "tool_call",
        EventType::ToolResult => "tool_result",
        EventType::Pause => "pause",
        EventType::Resume => "resume",
        EventType::Error => "error",
        EventType::Terminal => "terminal",
    }
}

/// One frame: `id:` carries the per-run sequence so a reconnecting client
/// can send it back as `Last-Event-ID`.
pub fn frame(record: &EventRecord) -> String {
    let data = match serde_json::to_string(record) {
        Ok(data) => data,
        Err(e) => {
            warn!(
                target: "helm::sse",
                run_id = %record.run_id,
                seq = record.sequence,
                error = %e,
                "Failed to serialize event"
            );
            return error_frame(ErrorKind::Permanent, "event could not be serialized");
        }
    };
    format!(
        "id: {}\nevent: {}\ndata: {}\n\n",
        record.sequence,
        sse_event_name(record.event.event_type()),
        data
    )
}

/// Final frame of a stream that ends on an error.
pub fn error_frame(kind: ErrorKind, message: &str) -> String {
    let data = json!({ "kind": kind, "message": message });
    format!("event: error\ndata: {data}\n\n")
}

/// Resume position from a `Last-Event-ID` header value; delivery continues
/// at `sequence + 1`.
pub fn parse_last_event_id(value: &str) -> Result<EventCursor, EventLogError> {
    value
        .trim()
        .parse::<u64>()
        .map(EventCursor::after)
        .map_err(|_| EventLogError::InvalidCursor {
            message: format!("Last-Event-ID must be a sequence number, got '{value}'"),
        })
}

/// SSE frames for a subscription. An error ends the stream after one
/// `error` frame.
pub fn frames(subscription: Subscription) -> impl Stream<Item = String> + Send {
    let mut events = Box::pin(subscription.into_stream());
    async_stream::stream! {
        while let Some(item) = events.next().await {
            match item {
                Ok(record) => yield frame(&record),
                Err(e) => {
                    yield error_frame(e.kind(), &e.to_string());
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RunEvent;
    use crate::session::RunStatus;
    use crate::types::{EventId, RunId};
    use chrono::Utc;
    use rstest::rstest;

    fn record(sequence: u64, event: RunEvent) -> EventRecord {
        EventRecord {
            sequence,
            event_id: EventId::new(),
            run_id: RunId::from("r1"),
            occurred_at: Utc::now(),
            event,
        }
    }

    #[rstest]
    #[case(EventType::UserMessage, "message")]
    #[case(EventType::AssistantChunk, "message")]
    #[case(EventType::AssistantMessage, "message")]
    #[case(EventType::ToolCall, "tool_call")]
    #[case(EventType::Terminal, "terminal")]
    fn maps_event_names(#[case] event_type: EventType, #[case] name: &str) {
        assert_eq!(sse_event_name(event_type), name);
    }

    #[test]
    fn frames_carry_sequence_as_id() {
        let text = frame(&record(7, RunEvent::terminal(RunStatus::Completed, None)));
        assert!(text.starts_with("id: 7\nevent: terminal\ndata: {"));
        assert!(text.ends_with("\n\n"));
        let data = text.lines().nth(2).unwrap().trim_start_matches("data: ");
        let value: serde_json::Value = serde_json::from_str(data).unwrap();
        assert_eq!(value["event"]["status"], "completed");
    }

    #[test]
    fn last_event_id_resumes_after_sequence() {
        assert_eq!(parse_last_event_id(" 41 ").unwrap(), EventCursor::after(41));
        assert!(matches!(
            parse_last_event_id("abc"),
            Err(EventLogError::InvalidCursor { .. })
        ));
    }

    #[test]
    fn error_frames_name_the_kind() {
        let text = error_frame(ErrorKind::Conflict, "lagged");
        assert_eq!(
            text,
            "event: error\ndata: {\"kind\":\"conflict\",\"message\":\"lagged\"}\n\n"
        );
    }
}
