mod slot;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::Stream;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use self::slot::{Closed, Slot};
use crate::config::BusConfig;
use crate::events::{EventCursor, EventLog, EventLogError, EventRecord};
use crate::types::RunId;
use helm_tools::ErrorKind;

const CATCH_UP_BATCH: usize = 256;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("Subscriber for run {run_id} fell behind and was disconnected")]
    Lagged { run_id: String },

    #[error(transparent)]
    EventLog(#[from] EventLogError),
}

impl BusError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BusError::Lagged { .. } => ErrorKind::Transient,
            BusError::EventLog(e) => e.kind(),
        }
    }
}

type SlotMap = Arc<Mutex<HashMap<u64, Arc<Slot>>>>;

struct Topic {
    tx: mpsc::UnboundedSender<EventRecord>,
    slots: SlotMap,
}

struct BusInner {
    log: Arc<dyn EventLog>,
    config: BusConfig,
    topics: Mutex<HashMap<RunId, Topic>>,
    next_id: AtomicU64,
}

impl BusInner {
    fn topics(&self) -> std::sync::MutexGuard<'_, HashMap<RunId, Topic>> {
        match self.topics.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn unregister(&self, run_id: &RunId, id: u64) {
        let mut topics = self.topics();
        let Some(topic) = topics.get(run_id) else {
            return;
        };
        let empty = {
            let mut slots = lock_slots(&topic.slots);
            if let Some(slot) = slots.remove(&id) {
                slot.close(Closed::Unsubscribed);
                let dropped = slot.dropped_chunks();
                if dropped > 0 {
                    debug!(
                        target: "helm::bus",
                        run_id = %run_id,
                        subscriber = id,
                        dropped,
                        "Subscriber lagged, chunks were dropped"
                    );
                }
            }
            slots.is_empty()
        };
        if empty {
            topics.remove(run_id);
            debug!(target: "helm::bus", run_id = %run_id, "Last subscriber left");
        }
    }
}

fn lock_slots(slots: &SlotMap) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<Slot>>> {
    match slots.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// In-process fan-out of committed events, keyed by run.
///
/// `publish` never waits: records are handed to a per-run dispatcher that
/// delivers into each subscriber's bounded queue, so a slow consumer never
/// holds up the appender.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(log: Arc<dyn EventLog>, config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                log,
                config,
                topics: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Fan out a record that is already durable in the event log.
    pub fn publish(&self, record: &EventRecord) {
        let topics = self.inner.topics();
        if let Some(topic) = topics.get(&record.run_id)
            && topic.tx.send(record.clone()).is_err()
        {
            debug!(target: "helm::bus", run_id = %record.run_id, "Dispatcher gone, dropping record");
        }
    }

    pub fn subscriber_count(&self, run_id: &RunId) -> usize {
        self.inner
            .topics()
            .get(run_id)
            .map_or(0, |topic| lock_slots(&topic.slots).len())
    }

    /// Subscribe to a run's events. With a cursor the subscription first
    /// replays the log after it, then continues live without gaps or
    /// duplicates. Cancelling `cancel` ends and unregisters the subscription.
    pub fn subscribe(
        &self,
        run_id: &RunId,
        from: Option<EventCursor>,
        cancel: CancellationToken,
    ) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Slot::new(self.inner.config.queue_capacity));
        {
            let mut topics = self.inner.topics();
            let topic = topics.entry(run_id.clone()).or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                let slots: SlotMap = Arc::default();
                tokio::spawn(dispatch(
                    run_id.clone(),
                    rx,
                    Arc::clone(&slots),
                    self.inner.config.publish_timeout(),
                ));
                Topic { tx, slots }
            });
            lock_slots(&topic.slots).insert(id, Arc::clone(&slot));
        }
        debug!(target: "helm::bus", run_id = %run_id, subscriber = id, ?from, "Subscribed");

        Subscription {
            run_id: run_id.clone(),
            id,
            slot,
            bus: Arc::downgrade(&self.inner),
            cancel,
            catch_up: from.map(|cursor| CatchUp {
                cursor,
                buffer: VecDeque::new(),
                exhausted: false,
            }),
            last_sequence: from.map_or(0, |c| c.sequence),
            finished: false,
        }
    }
}

async fn dispatch(
    run_id: RunId,
    mut rx: mpsc::UnboundedReceiver<EventRecord>,
    slots: SlotMap,
    timeout: std::time::Duration,
) {
    while let Some(record) = rx.recv().await {
        let targets: Vec<(u64, Arc<Slot>)> = lock_slots(&slots)
            .iter()
            .map(|(id, slot)| (*id, Arc::clone(slot)))
            .collect();
        for (id, slot) in targets {
            if !slot.deliver(record.clone(), timeout).await {
                warn!(
                    target: "helm::bus",
                    run_id = %run_id,
                    subscriber = id,
                    seq = record.sequence,
                    "Subscriber lagged on a structural event, closing subscription"
                );
                lock_slots(&slots).remove(&id);
            }
        }
    }
    debug!(target: "helm::bus", run_id = %run_id, "Dispatcher stopped");
}

struct CatchUp {
    cursor: EventCursor,
    buffer: VecDeque<EventRecord>,
    exhausted: bool,
}

/// A live view of one run's events. Ends after the run's terminal event.
pub struct Subscription {
    run_id: RunId,
    id: u64,
    slot: Arc<Slot>,
    bus: Weak<BusInner>,
    cancel: CancellationToken,
    catch_up: Option<CatchUp>,
    last_sequence: u64,
    finished: bool,
}

impl Subscription {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub async fn recv(&mut self) -> Option<Result<EventRecord, BusError>> {
        if self.finished {
            return None;
        }
        let cancel = self.cancel.clone();
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            next = self.next_record() => next,
        };
        match &next {
            Some(Ok(record)) if record.event.is_terminal() => self.finish(),
            Some(Err(_)) | None => self.finish(),
            Some(Ok(_)) => {}
        }
        next
    }

    async fn next_record(&mut self) -> Option<Result<EventRecord, BusError>> {
        if let Some(record) = self.next_catch_up().await {
            return Some(record);
        }
        loop {
            match self.slot.next().await {
                Ok(record) if record.sequence <= self.last_sequence => {}
                Ok(record) => {
                    self.last_sequence = record.sequence;
                    return Some(Ok(record));
                }
                Err(Closed::Lagged) => {
                    return Some(Err(BusError::Lagged {
                        run_id: self.run_id.to_string(),
                    }));
                }
                Err(Closed::Unsubscribed) => return None,
            }
        }
    }

    async fn next_catch_up(&mut self) -> Option<Result<EventRecord, BusError>> {
        let log = self.bus.upgrade().map(|bus| Arc::clone(&bus.log))?;
        let catch_up = self.catch_up.as_mut()?;
        if catch_up.buffer.is_empty() && !catch_up.exhausted {
            match log
                .scan(&self.run_id, Some(catch_up.cursor), CATCH_UP_BATCH)
                .await
            {
                Ok(page) => {
                    catch_up.exhausted = page.next_cursor.is_none();
                    catch_up.buffer.extend(page.events);
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
        match catch_up.buffer.pop_front() {
            Some(record) => {
                catch_up.cursor = record.cursor();
                self.last_sequence = record.sequence;
                Some(Ok(record))
            }
            None => {
                self.catch_up = None;
                None
            }
        }
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            if let Some(bus) = self.bus.upgrade() {
                bus.unregister(&self.run_id, self.id);
            }
        }
    }

    pub fn into_stream(mut self) -> impl Stream<Item = Result<EventRecord, BusError>> + Send {
        async_stream::stream! {
            while let Some(item) = self.recv().await {
                yield item;
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RunEvent;
    use crate::session::{InMemoryStore, RunStatus};
    use futures::StreamExt;
    use std::time::Duration;

    fn setup() -> (Arc<InMemoryStore>, EventBus) {
        let store = Arc::new(InMemoryStore::new());
        let bus = EventBus::new(store.clone(), BusConfig::default());
        (store, bus)
    }

    async fn append(store: &InMemoryStore, bus: &EventBus, run: &RunId, event: RunEvent) {
        let record = store.append(run, event).await.unwrap();
        bus.publish(&record);
    }

    fn user(text: &str) -> RunEvent {
        RunEvent::UserMessage { text: text.into() }
    }

    #[tokio::test]
    async fn catch_up_then_live_without_gaps() {
        let (store, bus) = setup();
        let run = RunId::from("r1");
        append(&store, &bus, &run, user("one")).await;
        append(&store, &bus, &run, user("two")).await;

        let mut sub = bus.subscribe(&run, Some(EventCursor::after(0)), CancellationToken::new());
        append(&store, &bus, &run, user("three")).await;
        append(
            &store,
            &bus,
            &run,
            RunEvent::terminal(RunStatus::Completed, None),
        )
        .await;

        let sequences: Vec<u64> = sub
            .into_stream()
            .map(|r| r.unwrap().sequence)
            .collect()
            .await;
        assert_eq!(sequences, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn live_subscription_skips_history() {
        let (store, bus) = setup();
        let run = RunId::from("r1");
        append(&store, &bus, &run, user("old")).await;
        let mut sub = bus.subscribe(&run, None, CancellationToken::new());
        append(&store, &bus, &run, user("new")).await;
        let record = sub.recv().await.unwrap().unwrap();
        assert_eq!(record.sequence, 2);
    }

    #[tokio::test]
    async fn cancellation_unregisters() {
        let (_store, bus) = setup();
        let run = RunId::from("r1");
        let cancel = CancellationToken::new();
        let mut sub = bus.subscribe(&run, None, cancel.clone());
        assert_eq!(bus.subscriber_count(&run), 1);
        cancel.cancel();
        assert!(sub.recv().await.is_none());
        assert_eq!(bus.subscriber_count(&run), 0);
    }

    #[tokio::test]
    async fn dropping_subscription_unregisters() {
        let (_store, bus) = setup();
        let run = RunId::from("r1");
        let sub = bus.subscribe(&run, None, CancellationToken::new());
        drop(sub);
        assert_eq!(bus.subscriber_count(&run), 0);
    }

    #[tokio::test]
    async fn slow_consumer_does_not_block_publish() {
        let store = Arc::new(InMemoryStore::new());
        let bus = EventBus::new(
            store.clone(),
            BusConfig {
                queue_capacity: 1,
                publish_timeout_ms: 20,
            },
        );
        let run = RunId::from("r1");
        let mut sub = bus.subscribe(&run, None, CancellationToken::new());
        for text in ["a", "b", "c"] {
            append(&store, &bus, &run, user(text)).await;
        }
        assert_eq!(store.head(&run).await.unwrap(), 3);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sub.recv().await.unwrap().unwrap().sequence, 1);
        assert!(matches!(sub.recv().await, Some(Err(BusError::Lagged { .. }))));
        assert!(sub.recv().await.is_none());
    }
}
