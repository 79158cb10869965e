use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use super::types::{Lease, RunMeta, RunStatus, Session, SessionAttributes};
use crate::types::{RunId, SessionId};
use helm_tools::ErrorKind;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Run not found: {run_id}")]
    RunNotFound { run_id: String },

    #[error("Session has ended: {session_id}")]
    SessionEnded { session_id: String },

    #[error("Run {run_id} is leased by {owner}")]
    LeaseHeld { run_id: String, owner: String },

    #[error("Run {run_id} is already {status}")]
    RunTerminal { run_id: String, status: RunStatus },

    #[error("Store operation '{operation}' timed out")]
    Timeout { operation: &'static str },

    #[error("Database error: {message}")]
    Database { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Migration error: {message}")]
    Migration { message: String },

    #[error("In-memory store lock poisoned: {message}")]
    LockPoisoned { message: String },
}

impl StoreError {
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

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn lock_poisoned(message: impl Into<String>) -> Self {
        Self::LockPoisoned {
            message: message.into(),
        }
    }

    pub fn session_not_found(session_id: &SessionId) -> Self {
        Self::SessionNotFound {
            session_id: session_id.to_string(),
        }
    }

    pub fn run_not_found(run_id: &RunId) -> Self {
        Self::RunNotFound {
            run_id: run_id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::SessionNotFound { .. } | StoreError::RunNotFound { .. } => {
                ErrorKind::NotFound
            }
            StoreError::SessionEnded { .. }
            | StoreError::LeaseHeld { .. }
            | StoreError::RunTerminal { .. } => ErrorKind::Conflict,
            StoreError::Timeout { .. } | StoreError::Connection { .. } => ErrorKind::Transient,
            StoreError::Database { .. }
            | StoreError::Serialization { .. }
            | StoreError::Migration { .. }
            | StoreError::LockPoisoned { .. } => ErrorKind::Permanent,
        }
    }
}

/// Durable session and run metadata.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Compare-and-set insert. An active session is returned unchanged; an
    /// ended one fails with `SessionEnded`. Attributes apply on insert only.
    async fn create_session(
        &self,
        id: &SessionId,
        created_at: DateTime<Utc>,
        attributes: SessionAttributes,
    ) -> Result<Session, StoreError>;

    async fn load_session(&self, id: &SessionId) -> Result<Session, StoreError>;

    /// Idempotent; the first `ended_at` wins.
    async fn end_session(
        &self,
        id: &SessionId,
        ended_at: DateTime<Utc>,
    ) -> Result<Session, StoreError>;

    /// Soft delete. The session stays loadable and is hidden from search
    /// unless deleted sessions are requested.
    async fn delete_session(
        &self,
        id: &SessionId,
        deleted_at: DateTime<Utc>,
    ) -> Result<Session, StoreError>;

    /// Insert or update a run. `started_at`, `agent_id` and `session_id` are
    /// kept from the first insert; terminal runs reject further changes.
    async fn upsert_run(&self, meta: &RunMeta) -> Result<RunMeta, StoreError>;

    async fn load_run(&self, run_id: &RunId) -> Result<RunMeta, StoreError>;

    /// Runs of a session ordered by `started_at` ascending.
    async fn list_runs_by_session(
        &self,
        session_id: &SessionId,
        statuses: Option<&[RunStatus]>,
    ) -> Result<Vec<RunMeta>, StoreError>;

    async fn list_runs_by_status(&self, statuses: &[RunStatus])
    -> Result<Vec<RunMeta>, StoreError>;

    /// Succeeds when no lease exists, it has expired, or `owner` holds it.
    async fn acquire_lease(
        &self,
        run_id: &RunId,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Lease, StoreError>;

    /// Extend a lease `owner` still holds.
    async fn renew_lease(
        &self,
        run_id: &RunId,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Lease, StoreError>;

    /// Drop the lease if `owner` holds it; otherwise a no-op.
    async fn release_lease(&self, run_id: &RunId, owner: &str) -> Result<(), StoreError>;
}

pub(crate) fn lease_expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX)
}

/// Shared precondition of `upsert_run`: the merged record a store persists,
/// or the conflict that rejects it.
pub(crate) fn merge_run(
    existing: Option<&RunMeta>,
    incoming: &RunMeta,
) -> Result<RunMeta, StoreError> {
    let Some(existing) = existing else {
        return Ok(incoming.clone());
    };
    if existing.status.is_terminal() && existing.status != incoming.status {
        return Err(StoreError::RunTerminal {
            run_id: existing.run_id.to_string(),
            status: existing.status,
        });
    }
    Ok(RunMeta {
        run_id: existing.run_id.clone(),
        agent_id: existing.agent_id.clone(),
        session_id: existing.session_id.clone(),
        started_at: existing.started_at,
        status: incoming.status,
        updated_at: incoming.updated_at,
        labels: incoming.labels.clone(),
        metadata: incoming.metadata.clone(),
    })
}

/// Transitions into `running` require a live session.
pub(crate) fn check_session_for_run(
    meta: &RunMeta,
    session: Option<&Session>,
) -> Result<(), StoreError> {
    if meta.status != RunStatus::Running {
        return Ok(());
    }
    match session {
        None => Err(StoreError::session_not_found(&meta.session_id)),
        Some(session) if !session.is_active() => Err(StoreError::SessionEnded {
            session_id: meta.session_id.to_string(),
        }),
        Some(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AgentId;
    use chrono::TimeZone;

    fn meta(status: RunStatus, secs: i64) -> RunMeta {
        let at = Utc.timestamp_opt(secs, 0).unwrap();
        RunMeta::new(RunId::from("r"), AgentId::from("a"), SessionId::from("s"), at)
            .with_status(status, at)
    }

    #[test]
    fn merge_preserves_started_at() {
        let first = meta(RunStatus::Pending, 10);
        let second = meta(RunStatus::Running, 20);
        let merged = merge_run(Some(&first), &second).unwrap();
        assert_eq!(merged.started_at, first.started_at);
        assert_eq!(merged.updated_at, second.updated_at);
        assert_eq!(merged.status, RunStatus::Running);
    }

    #[test]
    fn terminal_runs_reject_transitions() {
        let done = meta(RunStatus::Completed, 10);
        let err = merge_run(Some(&done), &meta(RunStatus::Running, 20)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(merge_run(Some(&done), &meta(RunStatus::Completed, 30)).is_ok());
    }

    #[test]
    fn running_requires_active_session() {
        let run = meta(RunStatus::Running, 10);
        assert!(matches!(
            check_session_for_run(&run, None),
            Err(StoreError::SessionNotFound { .. })
        ));
        let mut ended = Session::new(
            SessionId::from("s"),
            Utc.timestamp_opt(1, 0).unwrap(),
            SessionAttributes::default(),
        );
        ended.status = super::super::types::SessionStatus::Ended;
        assert!(matches!(
            check_session_for_run(&run, Some(&ended)),
            Err(StoreError::SessionEnded { .. })
        ));
        assert!(check_session_for_run(&meta(RunStatus::Failed, 1), None).is_ok());
    }
}
