use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;
use tracing::debug;

use super::notifier::AppendNotifier;
use super::{EventCursor, EventRecord, RunEvent};
use crate::types::RunId;
use helm_tools::ErrorKind;

/// Page size used internally by `tail` while catching up.
const TAIL_BATCH: usize = 256;

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("Run {run_id} already has a terminal event")]
    RunTerminated { run_id: String },

    #[error("Invalid cursor: {message}")]
    InvalidCursor { message: String },

    #[error("Event log operation '{operation}' timed out")]
    Timeout { operation: &'static str },

    #[error("Database error: {message}")]
    Database { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("In-memory store lock poisoned: {message}")]
    LockPoisoned { message: String },
}

impl EventLogError {
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn lock_poisoned(message: impl Into<String>) -> Self {
        Self::LockPoisoned {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EventLogError::RunTerminated { .. } => ErrorKind::Conflict,
            EventLogError::InvalidCursor { .. } => ErrorKind::Invalid,
            EventLogError::Timeout { .. } => ErrorKind::Transient,
            EventLogError::Database { .. }
            | EventLogError::Serialization { .. }
            | EventLogError::LockPoisoned { .. } => ErrorKind::Permanent,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventPage {
    pub events: Vec<EventRecord>,
    /// Present when more events existed past this page at scan time.
    pub next_cursor: Option<EventCursor>,
}

/// Append-only, per-run ordered event log.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Assign the next sequence and commit durably before returning.
    async fn append(&self, run_id: &RunId, event: RunEvent) -> Result<EventRecord, EventLogError>;

    /// Events strictly after `from`, in sequence order.
    async fn scan(
        &self,
        run_id: &RunId,
        from: Option<EventCursor>,
        limit: usize,
    ) -> Result<EventPage, EventLogError>;

    /// Highest committed sequence, or 0 for a run without events.
    async fn head(&self, run_id: &RunId) -> Result<u64, EventLogError>;

    fn notifier(&self) -> &AppendNotifier;

    /// The last `limit` events of the run, oldest first.
    async fn recent(&self, run_id: &RunId, limit: usize) -> Result<Vec<EventRecord>, EventLogError> {
        let head = self.head(run_id).await?;
        let from = head.saturating_sub(limit as u64);
        let page = self
            .scan(run_id, Some(EventCursor::after(from)), limit)
            .await?;
        Ok(page.events)
    }
}

/// Catch-up from `from` followed by the live tail. The stream ends after
/// yielding the run's terminal event.
pub fn tail(
    log: Arc<dyn EventLog>,
    run_id: RunId,
    from: Option<EventCursor>,
) -> impl Stream<Item = Result<EventRecord, EventLogError>> + Send {
    async_stream::try_stream! {
        let mut cursor = from;
        let mut head_rx = log.notifier().subscribe(&run_id);
        loop {
            let page = log.scan(&run_id, cursor, TAIL_BATCH).await?;
            let more = page.next_cursor.is_some();
            let mut finished = false;
            for record in page.events {
                cursor = Some(record.cursor());
                finished = record.event.is_terminal();
                yield record;
                if finished {
                    break;
                }
            }
            if finished {
                debug!(target: "helm::events", run_id = %run_id, "Tail reached terminal event");
                break;
            }
            if more {
                continue;
            }
            let seen = cursor.map_or(0, |c| c.sequence);
            if *head_rx.borrow_and_update() > seen {
                continue;
            }
            if head_rx.changed().await.is_err() {
                break;
            }
        }
    }
}
