use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::store::{
    SessionStore, StoreError, check_session_for_run, lease_expiry, merge_run,
};
use super::types::{Lease, RunMeta, RunStatus, Session, SessionAttributes, SessionStatus};
use crate::events::{
    AppendNotifier, EventCursor, EventLog, EventLogError, EventPage, EventRecord, RunEvent,
};
use crate::search::{
    FailureFilter, FailureRecord, SearchIndex, SeekKey, SessionFilter, SessionSort, SortOrder,
};
use crate::types::{EventId, RunId, SessionId};

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, Session>,
    runs: HashMap<RunId, RunMeta>,
    events: HashMap<RunId, Vec<EventRecord>>,
    leases: HashMap<RunId, Lease>,
}

/// Session store, event log and search index held in process memory. A
/// single lock over all collections keeps appends linearizable.
pub struct InMemoryStore {
    inner: RwLock<Inner>,
    notifier: AppendNotifier,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            notifier: AppendNotifier::new(),
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::lock_poisoned("store"))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::lock_poisoned("store"))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    async fn create_session(
        &self,
        id: &SessionId,
        created_at: DateTime<Utc>,
        attributes: SessionAttributes,
    ) -> Result<Session, StoreError> {
        let mut inner = self.write()?;
        if let Some(existing) = inner.sessions.get(id) {
            return match existing.status {
                SessionStatus::Active => Ok(existing.clone()),
                SessionStatus::Ended => Err(StoreError::SessionEnded {
                    session_id: id.to_string(),
                }),
            };
        }
        let session = Session::new(id.clone(), created_at, attributes);
        inner.sessions.insert(id.clone(), session.clone());
        Ok(session)
    }

    async fn load_session(&self, id: &SessionId) -> Result<Session, StoreError> {
        self.read()?
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::session_not_found(id))
    }

    async fn end_session(
        &self,
        id: &SessionId,
        ended_at: DateTime<Utc>,
    ) -> Result<Session, StoreError> {
        let mut inner = self.write()?;
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::session_not_found(id))?;
        if session.status == SessionStatus::Active {
            session.status = SessionStatus::Ended;
            session.ended_at = Some(ended_at);
            session.updated_at = ended_at;
        }
        Ok(session.clone())
    }

    async fn delete_session(
        &self,
        id: &SessionId,
        deleted_at: DateTime<Utc>,
    ) -> Result<Session, StoreError> {
        let mut inner = self.write()?;
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::session_not_found(id))?;
        if session.deleted_at.is_none() {
            session.deleted_at = Some(deleted_at);
        }
        Ok(session.clone())
    }

    async fn upsert_run(&self, meta: &RunMeta) -> Result<RunMeta, StoreError> {
        let mut inner = self.write()?;
        check_session_for_run(meta, inner.sessions.get(&meta.session_id))?;
        let merged = merge_run(inner.runs.get(&meta.run_id), meta)?;
        inner.runs.insert(merged.run_id.clone(), merged.clone());
        Ok(merged)
    }

    async fn load_run(&self, run_id: &RunId) -> Result<RunMeta, StoreError> {
        self.read()?
            .runs
            .get(run_id)
            .cloned()
            .ok_or_else(|| StoreError::run_not_found(run_id))
    }

    async fn list_runs_by_session(
        &self,
        session_id: &SessionId,
        statuses: Option<&[RunStatus]>,
    ) -> Result<Vec<RunMeta>, StoreError> {
        let inner = self.read()?;
        let mut runs: Vec<RunMeta> = inner
            .runs
            .values()
            .filter(|r| &r.session_id == session_id)
            .filter(|r| statuses.is_none_or(|s| s.contains(&r.status)))
            .cloned()
            .collect();
        runs.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        Ok(runs)
    }

    async fn list_runs_by_status(
        &self,
        statuses: &[RunStatus],
    ) -> Result<Vec<RunMeta>, StoreError> {
        let inner = self.read()?;
        let mut runs: Vec<RunMeta> = inner
            .runs
            .values()
            .filter(|r| statuses.contains(&r.status))
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(runs)
    }

    async fn acquire_lease(
        &self,
        run_id: &RunId,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Lease, StoreError> {
        let mut inner = self.write()?;
        if let Some(existing) = inner.leases.get(run_id)
            && !existing.grants(owner, now)
        {
            return Err(StoreError::LeaseHeld {
                run_id: run_id.to_string(),
                owner: existing.owner.clone(),
            });
        }
        let lease = Lease {
            run_id: run_id.clone(),
            owner: owner.to_string(),
            expires_at: lease_expiry(now, ttl),
        };
        inner.leases.insert(run_id.clone(), lease.clone());
        Ok(lease)
    }

    async fn renew_lease(
        &self,
        run_id: &RunId,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Lease, StoreError> {
        let mut inner = self.write()?;
        match inner.leases.get_mut(run_id) {
            Some(lease) if lease.owner == owner => {
                lease.expires_at = lease_expiry(now, ttl);
                Ok(lease.clone())
            }
            Some(lease) => Err(StoreError::LeaseHeld {
                run_id: run_id.to_string(),
                owner: lease.owner.clone(),
            }),
            None => {
                let lease = Lease {
                    run_id: run_id.clone(),
                    owner: owner.to_string(),
                    expires_at: lease_expiry(now, ttl),
                };
                inner.leases.insert(run_id.clone(), lease.clone());
                Ok(lease)
            }
        }
    }

    async fn release_lease(&self, run_id: &RunId, owner: &str) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        if inner
            .leases
            .get(run_id)
            .is_some_and(|lease| lease.owner == owner)
        {
            inner.leases.remove(run_id);
        }
        Ok(())
    }
}

#[async_trait]
impl EventLog for InMemoryStore {
    async fn append(&self, run_id: &RunId, event: RunEvent) -> Result<EventRecord, EventLogError> {
        let record = {
            let mut inner = self
                .inner
                .write()
                .map_err(|_| EventLogError::lock_poisoned("events"))?;
            let events = inner.events.entry(run_id.clone()).or_default();
            if events.last().is_some_and(|last| last.event.is_terminal()) {
                return Err(EventLogError::RunTerminated {
                    run_id: run_id.to_string(),
                });
            }
            let record = EventRecord {
                sequence: events.last().map_or(1, |last| last.sequence + 1),
                event_id: EventId::new(),
                run_id: run_id.clone(),
                occurred_at: Utc::now(),
                event,
            };
            events.push(record.clone());

            let session_id = inner.runs.get(run_id).map(|r| r.session_id.clone());
            if let Some(session) = session_id.and_then(|id| inner.sessions.get_mut(&id)) {
                session.last_event_at = Some(record.occurred_at);
            }
            record
        };
        self.notifier.notify(run_id, record.sequence);
        Ok(record)
    }

    async fn scan(
        &self,
        run_id: &RunId,
        from: Option<EventCursor>,
        limit: usize,
    ) -> Result<EventPage, EventLogError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| EventLogError::lock_poisoned("events"))?;
        let Some(events) = inner.events.get(run_id) else {
            return Ok(EventPage::default());
        };
        let after = from.map_or(0, |c| c.sequence);
        // Sequences are 1-based and gap-free, so the index is `after`.
        let start = usize::try_from(after).unwrap_or(usize::MAX).min(events.len());
        let end = start.saturating_add(limit).min(events.len());
        let page: Vec<EventRecord> = events[start..end].to_vec();
        let next_cursor = if end < events.len() {
            page.last().map(EventRecord::cursor)
        } else {
            None
        };
        Ok(EventPage {
            events: page,
            next_cursor,
        })
    }

    async fn head(&self, run_id: &RunId) -> Result<u64, EventLogError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| EventLogError::lock_poisoned("events"))?;
        Ok(inner
            .events
            .get(run_id)
            .and_then(|e| e.last())
            .map_or(0, |last| last.sequence))
    }

    fn notifier(&self) -> &AppendNotifier {
        &self.notifier
    }
}

#[async_trait]
impl SearchIndex for InMemoryStore {
    async fn query_sessions(
        &self,
        filter: &SessionFilter,
        sort: SessionSort,
        after: Option<&SeekKey>,
        limit: usize,
    ) -> Result<Vec<Session>, StoreError> {
        let inner = self.read()?;
        let mut sessions: Vec<Session> = inner
            .sessions
            .values()
            .filter(|s| filter.matches(s))
            .filter(|s| {
                after.is_none_or(|key| key.precedes(sort.sort_value(s), s.id.as_str(), sort.order))
            })
            .cloned()
            .collect();
        sessions.sort_by(|a, b| {
            let ord = sort
                .sort_value(a)
                .cmp(&sort.sort_value(b))
                .then_with(|| a.id.cmp(&b.id));
            match sort.order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        });
        sessions.truncate(limit);
        Ok(sessions)
    }

    async fn query_failures(
        &self,
        filter: &FailureFilter,
        after: Option<&SeekKey>,
        limit: usize,
    ) -> Result<Vec<FailureRecord>, StoreError> {
        let inner = self.read()?;
        let mut failures: Vec<FailureRecord> = inner
            .events
            .iter()
            .flat_map(|(run_id, events)| {
                let run = inner.runs.get(run_id);
                let org_id = run
                    .and_then(|r| inner.sessions.get(&r.session_id))
                    .and_then(|s| s.attributes.org_id.clone());
                events.iter().filter_map(move |record| {
                    let run = run?;
                    let RunEvent::ToolResult {
                        tool_name,
                        result_code,
                        result,
                        ..
                    } = &record.event
                    else {
                        return None;
                    };
                    Some(FailureRecord {
                        id: record.event_id,
                        run_id: run_id.clone(),
                        session_id: run.session_id.clone(),
                        agent_id: run.agent_id.clone(),
                        org_id: org_id.clone(),
                        tool_name: tool_name.clone(),
                        result_code: *result_code,
                        occurred_at: record.occurred_at,
                        sequence: record.sequence,
                        result: result.clone(),
                    })
                })
            })
            .filter(|f| filter.matches(f))
            .filter(|f| {
                after.is_none_or(|key| {
                    key.precedes(f.occurred_at, &f.id.to_string(), SortOrder::Desc)
                })
            })
            .collect();
        failures.sort_by(|a, b| {
            b.occurred_at
                .cmp(&a.occurred_at)
                .then_with(|| b.id.to_string().cmp(&a.id.to_string()))
        });
        failures.truncate(limit);
        Ok(failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AgentId;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[tokio::test]
    async fn create_session_is_idempotent_until_ended() {
        let store = InMemoryStore::new();
        let id = SessionId::from("s");
        let first = store
            .create_session(&id, at(100), SessionAttributes::default())
            .await
            .unwrap();
        let second = store
            .create_session(&id, at(200), SessionAttributes::default())
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(second.created_at, at(100));

        let ended = store.end_session(&id, at(300)).await.unwrap();
        assert_eq!(ended.status, SessionStatus::Ended);
        let again = store.end_session(&id, at(350)).await.unwrap();
        assert_eq!(again.ended_at, Some(at(300)));

        let err = store
            .create_session(&id, at(400), SessionAttributes::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::SessionEnded { .. }));
    }

    #[tokio::test]
    async fn lease_excludes_other_owners_until_expiry() {
        let store = InMemoryStore::new();
        let run = RunId::from("r");
        let ttl = Duration::from_secs(30);
        store.acquire_lease(&run, "a", ttl, at(0)).await.unwrap();
        let err = store.acquire_lease(&run, "b", ttl, at(10)).await.unwrap_err();
        assert!(matches!(err, StoreError::LeaseHeld { .. }));
        store.acquire_lease(&run, "b", ttl, at(31)).await.unwrap();
        assert!(store.renew_lease(&run, "a", ttl, at(32)).await.is_err());
        store.release_lease(&run, "a").await.unwrap();
        store.release_lease(&run, "b").await.unwrap();
        store.acquire_lease(&run, "a", ttl, at(33)).await.unwrap();
    }

    #[tokio::test]
    async fn appends_advance_last_event_at_and_stop_at_terminal() {
        let store = InMemoryStore::new();
        let sid = SessionId::from("s");
        store
            .create_session(&sid, at(1), SessionAttributes::default())
            .await
            .unwrap();
        let run = RunMeta::new(RunId::from("r"), AgentId::from("a"), sid.clone(), at(1));
        store.upsert_run(&run).await.unwrap();

        store
            .append(&run.run_id, RunEvent::UserMessage { text: "hi".into() })
            .await
            .unwrap();
        assert!(store.load_session(&sid).await.unwrap().last_event_at.is_some());

        store
            .append(
                &run.run_id,
                RunEvent::terminal(RunStatus::Completed, None),
            )
            .await
            .unwrap();
        let err = store
            .append(&run.run_id, RunEvent::AssistantChunk { text: "x".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, EventLogError::RunTerminated { .. }));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn sequences_are_gap_free(count in 1usize..40, page in 1usize..10) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let store = InMemoryStore::new();
                let run = RunId::from("r");
                for i in 0..count {
                    let record = store
                        .append(&run, RunEvent::AssistantChunk { text: i.to_string() })
                        .await
                        .unwrap();
                    prop_assert_eq!(record.sequence, i as u64 + 1);
                }

                let mut seen = Vec::new();
                let mut cursor = None;
                loop {
                    let result = store.scan(&run, cursor, page).await.unwrap();
                    seen.extend(result.events.iter().map(|e| e.sequence));
                    match result.next_cursor {
                        Some(next) => cursor = Some(next),
                        None => break,
                    }
                }
                prop_assert_eq!(seen, (1..=count as u64).collect::<Vec<_>>());
                Ok(())
            })?;
        }

        #[test]
        fn created_at_never_changes(times in proptest::collection::vec(0i64..1_000_000, 1..10)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let store = InMemoryStore::new();
                let id = SessionId::from("s");
                for t in &times {
                    let session = store
                        .create_session(&id, at(*t), SessionAttributes::default())
                        .await
                        .unwrap();
                    prop_assert_eq!(session.created_at, at(times[0]));
                }
                Ok(())
            })?;
        }
    }
}
