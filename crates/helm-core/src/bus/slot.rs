use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

use crate::events::{EventRecord, EventType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Closed {
    /// A structural event waited longer than the publish timeout.
    Lagged,
    Unsubscribed,
}

#[derive(Debug, Default)]
struct SlotState {
    queue: VecDeque<EventRecord>,
    closed: Option<Closed>,
    dropped_chunks: u64,
}

/// Bounded delivery queue of one subscription. `assistant_chunk` records
/// overflow drop-oldest; every other record waits for room.
#[derive(Debug)]
pub(crate) struct Slot {
    capacity: usize,
    state: Mutex<SlotState>,
    readable: Notify,
    writable: Notify,
}

fn is_chunk(record: &EventRecord) -> bool {
    record.event.event_type() == EventType::AssistantChunk
}

impl Slot {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(SlotState::default()),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SlotState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Try to enqueue without waiting. Returns the record back when only
    /// waiting could make room for it.
    fn offer(&self, record: EventRecord) -> Option<EventRecord> {
        let mut state = self.lock();
        if state.closed.is_some() {
            return None;
        }
        if state.queue.len() >= self.capacity {
            match state.queue.iter().position(is_chunk) {
                Some(oldest) => {
                    state.queue.remove(oldest);
                    state.dropped_chunks += 1;
                }
                None if is_chunk(&record) => {
                    state.dropped_chunks += 1;
                    return None;
                }
                None => return Some(record),
            }
        }
        state.queue.push_back(record);
        drop(state);
        self.readable.notify_one();
        None
    }

    /// Deliver `record`, waiting up to `timeout` for room. Returns `false`
    /// when the slot closed as lagged.
    pub(crate) async fn deliver(&self, record: EventRecord, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut pending = record;
        loop {
            let Some(record) = self.offer(pending) else {
                return true;
            };
            pending = record;
            if tokio::time::timeout_at(deadline, self.writable.notified())
                .await
                .is_err()
            {
                self.close(Closed::Lagged);
                return false;
            }
        }
    }

    pub(crate) fn close(&self, reason: Closed) {
        let mut state = self.lock();
        if state.closed.is_none() {
            state.closed = Some(reason);
        }
        drop(state);
        self.readable.notify_one();
        self.writable.notify_one();
    }

    /// Next queued record; `Err` once the slot is closed and drained.
    pub(crate) async fn next(&self) -> Result<EventRecord, Closed> {
        loop {
            let notified = self.readable.notified();
            {
                let mut state = self.lock();
                if let Some(record) = state.queue.pop_front() {
                    drop(state);
                    self.writable.notify_one();
                    return Ok(record);
                }
                if let Some(reason) = state.closed {
                    return Err(reason);
                }
            }
            notified.await;
        }
    }

    pub(crate) fn dropped_chunks(&self) -> u64 {
        self.lock().dropped_chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RunEvent;
    use crate::types::{EventId, RunId};
    use chrono::Utc;

    fn record(sequence: u64, event: RunEvent) -> EventRecord {
        EventRecord {
            sequence,
            event_id: EventId::new(),
            run_id: RunId::from("r"),
            occurred_at: Utc::now(),
            event,
        }
    }

    fn chunk(sequence: u64) -> EventRecord {
        record(
            sequence,
            RunEvent::AssistantChunk {
                text: sequence.to_string(),
            },
        )
    }

    fn message(sequence: u64) -> EventRecord {
        record(
            sequence,
            RunEvent::AssistantMessage {
                text: "done".into(),
            },
        )
    }

    #[tokio::test]
    async fn chunks_overflow_drop_oldest() {
        let slot = Slot::new(2);
        for seq in 1..=3 {
            assert!(slot.deliver(chunk(seq), Duration::from_millis(10)).await);
        }
        assert_eq!(slot.next().await.unwrap().sequence, 2);
        assert_eq!(slot.next().await.unwrap().sequence, 3);
        assert_eq!(slot.dropped_chunks(), 1);
    }

    #[tokio::test]
    async fn structural_events_evict_chunks_before_waiting() {
        let slot = Slot::new(2);
        slot.deliver(chunk(1), Duration::from_millis(10)).await;
        slot.deliver(message(2), Duration::from_millis(10)).await;
        assert!(slot.deliver(message(3), Duration::from_millis(10)).await);
        assert_eq!(slot.next().await.unwrap().sequence, 2);
        assert_eq!(slot.next().await.unwrap().sequence, 3);
    }

    #[tokio::test]
    async fn full_structural_queue_times_out_as_lagged() {
        let slot = Slot::new(1);
        assert!(slot.deliver(message(1), Duration::from_millis(10)).await);
        assert!(!slot.deliver(message(2), Duration::from_millis(20)).await);
        assert_eq!(slot.next().await.unwrap().sequence, 1);
        assert_eq!(slot.next().await.unwrap_err(), Closed::Lagged);
    }

    #[tokio::test]
    async fn waiting_publisher_resumes_when_consumer_reads() {
        let slot = std::sync::Arc::new(Slot::new(1));
        slot.deliver(message(1), Duration::from_millis(10)).await;
        let publisher = {
            let slot = slot.clone();
            tokio::spawn(async move { slot.deliver(message(2), Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(slot.next().await.unwrap().sequence, 1);
        assert!(publisher.await.unwrap());
        assert_eq!(slot.next().await.unwrap().sequence, 2);
    }
}
