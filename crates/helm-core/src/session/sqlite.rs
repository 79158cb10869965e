use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    QueryBuilder, Row, Sqlite,
    sqlite::{
        SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
        SqliteSynchronous,
    },
};
use tracing::debug;

use super::store::{
    SessionStore, StoreError, check_session_for_run, lease_expiry, merge_run,
};
use super::types::{Lease, RunMeta, RunStatus, Session, SessionAttributes, SessionStatus};
use crate::events::{
    AppendNotifier, EventCursor, EventLog, EventLogError, EventPage, EventRecord, RunEvent,
};
use crate::search::{
    FailureFilter, FailureRecord, SearchIndex, SeekKey, SessionFilter, SessionSort,
    SessionSortField, SortOrder,
};
use crate::types::{AgentId, EventId, RunId, SessionId};

const SESSION_COLUMNS: &str = "session_id, status, created_at, ended_at, updated_at, \
     org_id, agent_id, principal_id, last_event_at, deleted_at";
const RUN_COLUMNS: &str =
    "run_id, agent_id, session_id, status, started_at, updated_at, labels, metadata";

/// SQLite-backed session store, event log and search index.
///
/// The pool holds a single connection, so every transaction is serialized
/// and per-run sequence assignment is linearizable.
pub struct SqliteStore {
    pool: SqlitePool,
    timeout: Duration,
    notifier: AppendNotifier,
}

impl SqliteStore {
    pub async fn open(path: &Path, timeout: Duration) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::connection(format!("Failed to create directory: {e}"))
            })?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(|e| StoreError::connection(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        Self::connect(options, timeout).await
    }

    pub async fn open_in_memory(timeout: Duration) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::connection(format!("Invalid SQLite path: {e}")))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        Self::connect(options, timeout).await
    }

    async fn connect(options: SqliteConnectOptions, timeout: Duration) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::connection(format!("Failed to connect to SQLite: {e}")))?;

        let store = Self {
            pool,
            timeout,
            notifier: AppendNotifier::new(),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS agent_sessions (
                session_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                ended_at INTEGER,
                updated_at INTEGER NOT NULL,
                org_id TEXT,
                agent_id TEXT,
                principal_id TEXT,
                last_event_at INTEGER,
                deleted_at INTEGER
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS agent_runs (
                run_id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                labels TEXT NOT NULL,
                metadata TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_agent_runs_session ON agent_runs(session_id)",
            "CREATE INDEX IF NOT EXISTS idx_agent_runs_session_status ON agent_runs(session_id, status)",
            r#"
            CREATE TABLE IF NOT EXISTS run_events (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                occurred_at INTEGER NOT NULL,
                type TEXT NOT NULL,
                payload TEXT NOT NULL,
                tool_name TEXT,
                result_code TEXT,
                UNIQUE(run_id, sequence)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_run_events_run_time ON run_events(run_id, occurred_at)",
            "CREATE INDEX IF NOT EXISTS idx_run_events_failures ON run_events(result_code, occurred_at)",
            r#"
            CREATE TABLE IF NOT EXISTS run_leases (
                run_id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Migration {
                    message: format!("Failed to apply schema: {e}"),
                })?;
        }
        Ok(())
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout { operation })?
    }

    async fn bounded_log<T, F>(&self, operation: &'static str, fut: F) -> Result<T, EventLogError>
    where
        F: Future<Output = Result<T, EventLogError>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| EventLogError::Timeout { operation })?
    }

    /// The conflict reported when a guarded lease write kept another
    /// owner's row.
    async fn lease_conflict(&self, run_id: &RunId) -> StoreError {
        match fetch_lease(&self.pool, run_id).await {
            Ok(held) => StoreError::LeaseHeld {
                run_id: run_id.to_string(),
                owner: held.map_or_else(|| "unknown".to_string(), |lease| lease.owner),
            },
            Err(e) => e,
        }
    }
}

async fn fetch_session<'c, E>(executor: E, id: &SessionId) -> Result<Option<Session>, StoreError>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    let row = sqlx::query(&format!(
        "SELECT {SESSION_COLUMNS} FROM agent_sessions WHERE session_id = ?1"
    ))
    .bind(id.as_str())
    .fetch_optional(executor)
    .await
    .map_err(|e| StoreError::database(format!("Failed to load session: {e}")))?;
    row.as_ref().map(session_from_row).transpose()
}

async fn fetch_run<'c, E>(executor: E, run_id: &RunId) -> Result<Option<RunMeta>, StoreError>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM agent_runs WHERE run_id = ?1"))
        .bind(run_id.as_str())
        .fetch_optional(executor)
        .await
        .map_err(|e| StoreError::database(format!("Failed to load run: {e}")))?;
    row.as_ref().map(run_from_row).transpose()
}

async fn fetch_lease<'c, E>(executor: E, run_id: &RunId) -> Result<Option<Lease>, StoreError>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    let row = sqlx::query("SELECT run_id, owner, expires_at FROM run_leases WHERE run_id = ?1")
        .bind(run_id.as_str())
        .fetch_optional(executor)
        .await
        .map_err(|e| StoreError::database(format!("Failed to load lease: {e}")))?;
    row.map(|row| {
        Ok(Lease {
            run_id: RunId::new(get::<String>(&row, "run_id")?),
            owner: get(&row, "owner")?,
            expires_at: from_micros(get(&row, "expires_at")?)?,
        })
    })
    .transpose()
}

fn get<'r, T>(row: &'r SqliteRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(column)
        .map_err(|e| StoreError::database(format!("Failed to read column {column}: {e}")))
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| StoreError::serialization(format!("Timestamp out of range: {micros}")))
}

fn opt_micros(micros: Option<i64>) -> Result<Option<DateTime<Utc>>, StoreError> {
    micros.map(from_micros).transpose()
}

fn session_from_row(row: &SqliteRow) -> Result<Session, StoreError> {
    let status: String = get(row, "status")?;
    Ok(Session {
        id: SessionId::new(get::<String>(row, "session_id")?),
        status: SessionStatus::from_str(&status).map_err(StoreError::serialization)?,
        created_at: from_micros(get(row, "created_at")?)?,
        ended_at: opt_micros(get(row, "ended_at")?)?,
        updated_at: from_micros(get(row, "updated_at")?)?,
        attributes: SessionAttributes {
            org_id: get(row, "org_id")?,
            agent_id: get(row, "agent_id")?,
            principal_id: get(row, "principal_id")?,
        },
        last_event_at: opt_micros(get(row, "last_event_at")?)?,
        deleted_at: opt_micros(get(row, "deleted_at")?)?,
    })
}

fn run_from_row(row: &SqliteRow) -> Result<RunMeta, StoreError> {
    let status: String = get(row, "status")?;
    let labels: String = get(row, "labels")?;
    let metadata: String = get(row, "metadata")?;
    Ok(RunMeta {
        run_id: RunId::new(get::<String>(row, "run_id")?),
        agent_id: AgentId::new(get::<String>(row, "agent_id")?),
        session_id: SessionId::new(get::<String>(row, "session_id")?),
        status: RunStatus::from_str(&status).map_err(StoreError::serialization)?,
        started_at: from_micros(get(row, "started_at")?)?,
        updated_at: from_micros(get(row, "updated_at")?)?,
        labels: serde_json::from_str(&labels)
            .map_err(|e| StoreError::serialization(format!("Invalid labels: {e}")))?,
        metadata: serde_json::from_str(&metadata)
            .map_err(|e| StoreError::serialization(format!("Invalid metadata: {e}")))?,
    })
}

fn record_from_row(row: &SqliteRow, run_id: &RunId) -> Result<EventRecord, EventLogError> {
    let read = |e: sqlx::Error| EventLogError::database(format!("Failed to read event: {e}"));
    let id: String = row.try_get("id").map_err(read)?;
    let sequence: i64 = row.try_get("sequence").map_err(read)?;
    let occurred_at: i64 = row.try_get("occurred_at").map_err(read)?;
    let payload: String = row.try_get("payload").map_err(read)?;
    Ok(EventRecord {
        sequence: sequence as u64,
        event_id: EventId::from_str(&id)
            .map_err(|e| EventLogError::serialization(format!("Invalid event id: {e}")))?,
        run_id: run_id.clone(),
        occurred_at: DateTime::from_timestamp_micros(occurred_at).ok_or_else(|| {
            EventLogError::serialization(format!("Timestamp out of range: {occurred_at}"))
        })?,
        event: serde_json::from_str(&payload)
            .map_err(|e| EventLogError::serialization(format!("Invalid event data: {e}")))?,
    })
}

fn statuses_clause(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, statuses: &[RunStatus]) {
    qb.push(format!(" AND {column} IN ("));
    let mut separated = qb.separated(", ");
    for status in statuses {
        separated.push_bind(status.as_str());
    }
    separated.push_unseparated(")");
}

fn in_clause(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, values: &[String]) {
    if values.is_empty() {
        return;
    }
    qb.push(format!(" AND {column} IN ("));
    let mut separated = qb.separated(", ");
    for value in values {
        separated.push_bind(value.clone());
    }
    separated.push_unseparated(")");
}

fn range_clause(
    qb: &mut QueryBuilder<'_, Sqlite>,
    column: &str,
    range: Option<crate::search::TimeRange>,
) {
    let Some(range) = range else {
        return;
    };
    qb.push(format!(" AND {column} IS NOT NULL"));
    if let Some(from) = range.from {
        qb.push(format!(" AND {column} >= "));
        qb.push_bind(from.timestamp_micros());
    }
    if let Some(to) = range.to {
        qb.push(format!(" AND {column} < "));
        qb.push_bind(to.timestamp_micros());
    }
}

fn seek_clause(
    qb: &mut QueryBuilder<'_, Sqlite>,
    sort_expr: &str,
    id_column: &str,
    key: &SeekKey,
    order: SortOrder,
) {
    let op = match order {
        SortOrder::Asc => ">",
        SortOrder::Desc => "<",
    };
    let value = key.sort_value.timestamp_micros();
    qb.push(format!(" AND ({sort_expr} {op} "));
    qb.push_bind(value);
    qb.push(format!(" OR ({sort_expr} = "));
    qb.push_bind(value);
    qb.push(format!(" AND {id_column} {op} "));
    qb.push_bind(key.id.clone());
    qb.push("))");
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn create_session(
        &self,
        id: &SessionId,
        created_at: DateTime<Utc>,
        attributes: SessionAttributes,
    ) -> Result<Session, StoreError> {
        self.bounded("create_session", async {
            sqlx::query(
                r#"
                INSERT INTO agent_sessions
                    (session_id, status, created_at, updated_at, org_id, agent_id, principal_id)
                VALUES (?1, 'active', ?2, ?2, ?3, ?4, ?5)
                ON CONFLICT(session_id) DO NOTHING
                "#,
            )
            .bind(id.as_str())
            .bind(created_at.timestamp_micros())
            .bind(attributes.org_id.as_deref())
            .bind(attributes.agent_id.as_deref())
            .bind(attributes.principal_id.as_deref())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::database(format!("Failed to create session: {e}")))?;

            let session = fetch_session(&self.pool, id)
                .await?
                .ok_or_else(|| StoreError::session_not_found(id))?;
            if session.status == SessionStatus::Ended {
                return Err(StoreError::SessionEnded {
                    session_id: id.to_string(),
                });
            }
            Ok(session)
        })
        .await
    }

    async fn load_session(&self, id: &SessionId) -> Result<Session, StoreError> {
        self.bounded("load_session", async {
            fetch_session(&self.pool, id)
                .await?
                .ok_or_else(|| StoreError::session_not_found(id))
        })
        .await
    }

    async fn end_session(
        &self,
        id: &SessionId,
        ended_at: DateTime<Utc>,
    ) -> Result<Session, StoreError> {
        self.bounded("end_session", async {
            sqlx::query(
                r#"
                UPDATE agent_sessions
                SET status = 'ended', ended_at = ?2, updated_at = ?2
                WHERE session_id = ?1 AND status = 'active'
                "#,
            )
            .bind(id.as_str())
            .bind(ended_at.timestamp_micros())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::database(format!("Failed to end session: {e}")))?;

            fetch_session(&self.pool, id)
                .await?
                .ok_or_else(|| StoreError::session_not_found(id))
        })
        .await
    }

    async fn delete_session(
        &self,
        id: &SessionId,
        deleted_at: DateTime<Utc>,
    ) -> Result<Session, StoreError> {
        self.bounded("delete_session", async {
            sqlx::query(
                "UPDATE agent_sessions SET deleted_at = COALESCE(deleted_at, ?2) WHERE session_id = ?1",
            )
            .bind(id.as_str())
            .bind(deleted_at.timestamp_micros())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::database(format!("Failed to delete session: {e}")))?;

            fetch_session(&self.pool, id)
                .await?
                .ok_or_else(|| StoreError::session_not_found(id))
        })
        .await
    }

    async fn upsert_run(&self, meta: &RunMeta) -> Result<RunMeta, StoreError> {
        self.bounded("upsert_run", async {
            // The session check, terminal check and write share one transaction.
            let mut tx = self.pool.begin().await.map_err(|e| {
                StoreError::database(format!("Failed to begin transaction: {e}"))
            })?;
            let session = fetch_session(&mut *tx, &meta.session_id).await?;
            check_session_for_run(meta, session.as_ref())?;
            let existing = fetch_run(&mut *tx, &meta.run_id).await?;
            let merged = merge_run(existing.as_ref(), meta)?;

            let labels = serde_json::to_string(&merged.labels)
                .map_err(|e| StoreError::serialization(format!("Invalid labels: {e}")))?;
            let metadata = serde_json::to_string(&merged.metadata)
                .map_err(|e| StoreError::serialization(format!("Invalid metadata: {e}")))?;

            sqlx::query(
                r#"
                INSERT INTO agent_runs
                    (run_id, agent_id, session_id, status, started_at, updated_at, labels, metadata)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(run_id) DO UPDATE SET
                    status = excluded.status,
                    updated_at = excluded.updated_at,
                    labels = excluded.labels,
                    metadata = excluded.metadata
                "#,
            )
            .bind(merged.run_id.as_str())
            .bind(merged.agent_id.as_str())
            .bind(merged.session_id.as_str())
            .bind(merged.status.as_str())
            .bind(merged.started_at.timestamp_micros())
            .bind(merged.updated_at.timestamp_micros())
            .bind(labels)
            .bind(metadata)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::database(format!("Failed to upsert run: {e}")))?;

            tx.commit()
                .await
                .map_err(|e| StoreError::database(format!("Failed to commit run: {e}")))?;
            Ok(merged)
        })
        .await
    }

    async fn load_run(&self, run_id: &RunId) -> Result<RunMeta, StoreError> {
        self.bounded("load_run", async {
            fetch_run(&self.pool, run_id)
                .await?
                .ok_or_else(|| StoreError::run_not_found(run_id))
        })
        .await
    }

    async fn list_runs_by_session(
        &self,
        session_id: &SessionId,
        statuses: Option<&[RunStatus]>,
    ) -> Result<Vec<RunMeta>, StoreError> {
        self.bounded("list_runs_by_session", async {
            let mut qb = QueryBuilder::<Sqlite>::new(format!(
                "SELECT {RUN_COLUMNS} FROM agent_runs WHERE session_id = "
            ));
            qb.push_bind(session_id.as_str());
            if let Some(statuses) = statuses {
                if statuses.is_empty() {
                    return Ok(Vec::new());
                }
                statuses_clause(&mut qb, "status", statuses);
            }
            qb.push(" ORDER BY started_at ASC, run_id ASC");
            let rows = qb
                .build()
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StoreError::database(format!("Failed to list runs: {e}")))?;
            rows.iter().map(run_from_row).collect()
        })
        .await
    }

    async fn list_runs_by_status(
        &self,
        statuses: &[RunStatus],
    ) -> Result<Vec<RunMeta>, StoreError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        self.bounded("list_runs_by_status", async {
            let mut qb =
                QueryBuilder::<Sqlite>::new(format!("SELECT {RUN_COLUMNS} FROM agent_runs WHERE 1 = 1"));
            statuses_clause(&mut qb, "status", statuses);
            qb.push(" ORDER BY started_at ASC");
            let rows = qb
                .build()
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StoreError::database(format!("Failed to list runs: {e}")))?;
            rows.iter().map(run_from_row).collect()
        })
        .await
    }

    async fn acquire_lease(
        &self,
        run_id: &RunId,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Lease, StoreError> {
        self.bounded("acquire_lease", async {
            let lease = Lease {
                run_id: run_id.clone(),
                owner: owner.to_string(),
                expires_at: lease_expiry(now, ttl),
            };
            // Check and take in one statement: the update only lands on a
            // row this owner already holds or one that has expired.
            let written = sqlx::query(
                r#"
                INSERT INTO run_leases (run_id, owner, expires_at) VALUES (?1, ?2, ?3)
                ON CONFLICT(run_id) DO UPDATE SET
                    owner = excluded.owner,
                    expires_at = excluded.expires_at
                WHERE run_leases.owner = excluded.owner OR run_leases.expires_at <= ?4
                "#,
            )
            .bind(run_id.as_str())
            .bind(owner)
            .bind(lease.expires_at.timestamp_micros())
            .bind(now.timestamp_micros())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::database(format!("Failed to write lease: {e}")))?;
            if written.rows_affected() == 0 {
                return Err(self.lease_conflict(run_id).await);
            }
            Ok(lease)
        })
        .await
    }

    async fn renew_lease(
        &self,
        run_id: &RunId,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Lease, StoreError> {
        self.bounded("renew_lease", async {
            let lease = Lease {
                run_id: run_id.clone(),
                owner: owner.to_string(),
                expires_at: lease_expiry(now, ttl),
            };
            let written = sqlx::query(
                r#"
                INSERT INTO run_leases (run_id, owner, expires_at) VALUES (?1, ?2, ?3)
                ON CONFLICT(run_id) DO UPDATE SET expires_at = excluded.expires_at
                WHERE run_leases.owner = excluded.owner
                "#,
            )
            .bind(run_id.as_str())
            .bind(owner)
            .bind(lease.expires_at.timestamp_micros())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::database(format!("Failed to renew lease: {e}")))?;
            if written.rows_affected() == 0 {
                return Err(self.lease_conflict(run_id).await);
            }
            Ok(lease)
        })
        .await
    }

    async fn release_lease(&self, run_id: &RunId, owner: &str) -> Result<(), StoreError> {
        self.bounded("release_lease", async {
            sqlx::query("DELETE FROM run_leases WHERE run_id = ?1 AND owner = ?2")
                .bind(run_id.as_str())
                .bind(owner)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::database(format!("Failed to release lease: {e}")))?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl EventLog for SqliteStore {
    async fn append(&self, run_id: &RunId, event: RunEvent) -> Result<EventRecord, EventLogError> {
        let record = self
            .bounded_log("append", async {
                let payload = serde_json::to_string(&event).map_err(|e| {
                    EventLogError::serialization(format!("Failed to serialize event: {e}"))
                })?;
                let mut tx = self.pool.begin().await.map_err(|e| {
                    EventLogError::database(format!("Failed to begin transaction: {e}"))
                })?;

                let last = sqlx::query(
                    "SELECT sequence, type FROM run_events WHERE run_id = ?1 ORDER BY sequence DESC LIMIT 1",
                )
                .bind(run_id.as_str())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| EventLogError::database(format!("Failed to read head: {e}")))?;

                let mut sequence: i64 = 1;
                if let Some(row) = last {
                    let head: i64 = row.try_get("sequence").map_err(|e| {
                        EventLogError::database(format!("Failed to read head: {e}"))
                    })?;
                    let kind: String = row.try_get("type").map_err(|e| {
                        EventLogError::database(format!("Failed to read head: {e}"))
                    })?;
                    if kind == "terminal" {
                        return Err(EventLogError::RunTerminated {
                            run_id: run_id.to_string(),
                        });
                    }
                    sequence = head + 1;
                }

                let event_id = EventId::new();
                let occurred_at = Utc::now();
                let (tool_name, result_code) = event
                    .tool_outcome()
                    .map_or((None, None), |(name, code)| {
                        (Some(name.to_string()), Some(code.as_str()))
                    });

                sqlx::query(
                    r#"
                    INSERT INTO run_events
                        (id, run_id, sequence, occurred_at, type, payload, tool_name, result_code)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                    "#,
                )
                .bind(event_id.to_string())
                .bind(run_id.as_str())
                .bind(sequence)
                .bind(occurred_at.timestamp_micros())
                .bind(event.event_type().as_str())
                .bind(&payload)
                .bind(tool_name)
                .bind(result_code)
                .execute(&mut *tx)
                .await
                .map_err(|e| EventLogError::database(format!("Failed to append event: {e}")))?;

                sqlx::query(
                    r#"
                    UPDATE agent_sessions SET last_event_at = ?2
                    WHERE session_id = (SELECT session_id FROM agent_runs WHERE run_id = ?1)
                    "#,
                )
                .bind(run_id.as_str())
                .bind(occurred_at.timestamp_micros())
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    EventLogError::database(format!("Failed to touch session: {e}"))
                })?;

                tx.commit().await.map_err(|e| {
                    EventLogError::database(format!("Failed to commit event: {e}"))
                })?;

                let occurred_at = DateTime::from_timestamp_micros(occurred_at.timestamp_micros())
                    .unwrap_or(occurred_at);
                Ok(EventRecord {
                    sequence: sequence as u64,
                    event_id,
                    run_id: run_id.clone(),
                    occurred_at,
                    event,
                })
            })
            .await?;

        debug!(target: "helm::store", run_id = %run_id, seq = record.sequence, "Appended event");
        self.notifier.notify(run_id, record.sequence);
        Ok(record)
    }

    async fn scan(
        &self,
        run_id: &RunId,
        from: Option<EventCursor>,
        limit: usize,
    ) -> Result<EventPage, EventLogError> {
        self.bounded_log("scan", async {
            let after = from.map_or(0, |c| c.sequence) as i64;
            let rows = sqlx::query(
                r#"
                SELECT id, sequence, occurred_at, payload
                FROM run_events
                WHERE run_id = ?1 AND sequence > ?2
                ORDER BY sequence ASC
                LIMIT ?3
                "#,
            )
            .bind(run_id.as_str())
            .bind(after)
            .bind(limit.saturating_add(1) as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EventLogError::database(format!("Failed to scan events: {e}")))?;

            let mut events = rows
                .iter()
                .map(|row| record_from_row(row, run_id))
                .collect::<Result<Vec<_>, _>>()?;
            let next_cursor = if events.len() > limit {
                events.truncate(limit);
                events.last().map(EventRecord::cursor)
            } else {
                None
            };
            Ok(EventPage {
                events,
                next_cursor,
            })
        })
        .await
    }

    async fn head(&self, run_id: &RunId) -> Result<u64, EventLogError> {
        self.bounded_log("head", async {
            let head: i64 = sqlx::query_scalar(
                "SELECT COALESCE(MAX(sequence), 0) FROM run_events WHERE run_id = ?1",
            )
            .bind(run_id.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| EventLogError::database(format!("Failed to read head: {e}")))?;
            Ok(head as u64)
        })
        .await
    }

    fn notifier(&self) -> &AppendNotifier {
        &self.notifier
    }
}

#[async_trait]
impl SearchIndex for SqliteStore {
    async fn query_sessions(
        &self,
        filter: &SessionFilter,
        sort: SessionSort,
        after: Option<&SeekKey>,
        limit: usize,
    ) -> Result<Vec<Session>, StoreError> {
        self.bounded("query_sessions", async {
            let sort_expr = match sort.field {
                SessionSortField::CreatedAt => "created_at",
                SessionSortField::LastEventAt => "COALESCE(last_event_at, created_at)",
            };
            let mut qb = QueryBuilder::<Sqlite>::new(format!(
                "SELECT {SESSION_COLUMNS} FROM agent_sessions WHERE 1 = 1"
            ));
            if !filter.include_deleted {
                qb.push(" AND deleted_at IS NULL");
            }
            in_clause(&mut qb, "org_id", &filter.org_ids);
            in_clause(&mut qb, "agent_id", &filter.agent_ids);
            in_clause(&mut qb, "principal_id", &filter.principal_ids);
            range_clause(&mut qb, "created_at", filter.created_range);
            range_clause(&mut qb, "last_event_at", filter.last_event_range);
            if let Some(key) = after {
                seek_clause(&mut qb, sort_expr, "session_id", key, sort.order);
            }
            let direction = match sort.order {
                SortOrder::Asc => "ASC",
                SortOrder::Desc => "DESC",
            };
            qb.push(format!(
                " ORDER BY {sort_expr} {direction}, session_id {direction} LIMIT "
            ));
            qb.push_bind(limit as i64);

            let rows = qb
                .build()
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StoreError::database(format!("Failed to search sessions: {e}")))?;
            rows.iter().map(session_from_row).collect()
        })
        .await
    }

    async fn query_failures(
        &self,
        filter: &FailureFilter,
        after: Option<&SeekKey>,
        limit: usize,
    ) -> Result<Vec<FailureRecord>, StoreError> {
        self.bounded("query_failures", async {
            let mut qb = QueryBuilder::<Sqlite>::new(
                r#"
                SELECT e.id, e.run_id, e.sequence, e.occurred_at, e.payload,
                       e.tool_name, e.result_code, r.session_id, r.agent_id, s.org_id
                FROM run_events e
                JOIN agent_runs r ON r.run_id = e.run_id
                LEFT JOIN agent_sessions s ON s.session_id = r.session_id
                WHERE e.type = 'tool_result' AND e.result_code <> 'ok'
                "#,
            );
            in_clause(&mut qb, "s.org_id", &filter.org_ids);
            in_clause(&mut qb, "r.agent_id", &filter.agent_ids);
            in_clause(&mut qb, "e.tool_name", &filter.tool_names);
            let codes: Vec<String> = filter
                .result_codes
                .iter()
                .map(|c| c.as_str().to_string())
                .collect();
            in_clause(&mut qb, "e.result_code", &codes);
            range_clause(&mut qb, "e.occurred_at", filter.occurred_range);
            if let Some(key) = after {
                seek_clause(&mut qb, "e.occurred_at", "e.id", key, SortOrder::Desc);
            }
            qb.push(" ORDER BY e.occurred_at DESC, e.id DESC LIMIT ");
            qb.push_bind(limit as i64);

            let rows = qb
                .build()
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StoreError::database(format!("Failed to search failures: {e}")))?;

            rows.iter()
                .map(|row| {
                    let run_id = RunId::new(get::<String>(row, "run_id")?);
                    let record = record_from_row(row, &run_id)
                        .map_err(|e| StoreError::serialization(e.to_string()))?;
                    let RunEvent::ToolResult {
                        tool_name,
                        result_code,
                        result,
                        ..
                    } = record.event
                    else {
                        return Err(StoreError::serialization("Indexed failure is not a tool result"));
                    };
                    Ok(FailureRecord {
                        id: record.event_id,
                        run_id,
                        session_id: SessionId::new(get::<String>(row, "session_id")?),
                        agent_id: AgentId::new(get::<String>(row, "agent_id")?),
                        org_id: get(row, "org_id")?,
                        tool_name,
                        result_code,
                        occurred_at: record.occurred_at,
                        sequence: record.sequence,
                        result,
                    })
                })
                .collect()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use helm_tools::ResultCode;
    use serde_json::json;
    use std::sync::Arc;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    async fn store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("helm.db"), Duration::from_secs(5))
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn session_lifecycle_matches_contract() {
        let (_dir, store) = store().await;
        let id = SessionId::from("s");
        let attrs = SessionAttributes {
            org_id: Some("org".into()),
            ..Default::default()
        };
        let first = store.create_session(&id, at(100), attrs).await.unwrap();
        let second = store
            .create_session(&id, at(200), SessionAttributes::default())
            .await
            .unwrap();
        assert_eq!(second.created_at, at(100));
        assert_eq!(second.attributes.org_id.as_deref(), Some("org"));
        assert_eq!(first, second);

        let ended = store.end_session(&id, at(300)).await.unwrap();
        assert_eq!(ended.ended_at, Some(at(300)));
        assert_eq!(store.end_session(&id, at(301)).await.unwrap().ended_at, Some(at(300)));
        assert!(matches!(
            store
                .create_session(&id, at(400), SessionAttributes::default())
                .await,
            Err(StoreError::SessionEnded { .. })
        ));
    }

    #[tokio::test]
    async fn runs_keep_started_at_and_list_in_order() {
        let (_dir, store) = store().await;
        let sid = SessionId::from("s");
        store
            .create_session(&sid, at(1), SessionAttributes::default())
            .await
            .unwrap();
        for (id, secs) in [("r2", 20), ("r1", 10)] {
            let run = RunMeta::new(RunId::from(id), AgentId::from("a"), sid.clone(), at(secs));
            store.upsert_run(&run).await.unwrap();
        }
        let mut update = store.load_run(&RunId::from("r1")).await.unwrap();
        update.started_at = at(99);
        update = update.with_status(RunStatus::Running, at(50));
        let merged = store.upsert_run(&update).await.unwrap();
        assert_eq!(merged.started_at, at(10));

        let runs = store.list_runs_by_session(&sid, None).await.unwrap();
        let ids: Vec<_> = runs.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r2"]);

        let running = store
            .list_runs_by_session(&sid, Some(&[RunStatus::Running]))
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
    }

    #[tokio::test]
    async fn append_assigns_gap_free_sequences_and_indexes_failures() {
        let (_dir, store) = store().await;
        let sid = SessionId::from("s");
        store
            .create_session(
                &sid,
                at(1),
                SessionAttributes {
                    org_id: Some("acme".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let run = RunMeta::new(RunId::from("r"), AgentId::from("a"), sid.clone(), at(1));
        store.upsert_run(&run).await.unwrap();

        for code in [ResultCode::Ok, ResultCode::Timeout, ResultCode::Denied] {
            store
                .append(
                    &run.run_id,
                    RunEvent::ToolResult {
                        call_id: "c".into(),
                        tool_name: "orders.cancel".into(),
                        result_code: code,
                        result: json!({}),
                        sidecar: None,
                    },
                )
                .await
                .unwrap();
        }
        assert_eq!(store.head(&run.run_id).await.unwrap(), 3);

        let page = store.scan(&run.run_id, None, 2).await.unwrap();
        assert_eq!(page.events.len(), 2);
        let rest = store
            .scan(&run.run_id, page.next_cursor, 10)
            .await
            .unwrap();
        assert_eq!(rest.events[0].sequence, 3);
        assert!(rest.next_cursor.is_none());

        let failures = store
            .query_failures(&FailureFilter::default(), None, 10)
            .await
            .unwrap();
        assert_eq!(failures.len(), 2);
        assert!(failures.iter().all(|f| f.org_id.as_deref() == Some("acme")));

        let timeouts = store
            .query_failures(
                &FailureFilter {
                    result_codes: vec![ResultCode::Timeout],
                    ..Default::default()
                },
                None,
                10,
            )
            .await
            .unwrap();
        assert_eq!(timeouts.len(), 1);
        assert!(store.load_session(&sid).await.unwrap().last_event_at.is_some());
    }

    #[tokio::test]
    async fn lease_conflicts_surface_as_lease_held() {
        let (_dir, store) = store().await;
        let run = RunId::from("r");
        let ttl = Duration::from_secs(30);
        store.acquire_lease(&run, "a", ttl, at(0)).await.unwrap();
        assert!(matches!(
            store.acquire_lease(&run, "b", ttl, at(1)).await,
            Err(StoreError::LeaseHeld { .. })
        ));
        store.release_lease(&run, "a").await.unwrap();
        store.acquire_lease(&run, "b", ttl, at(2)).await.unwrap();
    }

    #[tokio::test]
    async fn renewal_keeps_other_owners_out() {
        let (_dir, store) = store().await;
        let run = RunId::from("r");
        let ttl = Duration::from_secs(30);
        store.acquire_lease(&run, "a", ttl, at(0)).await.unwrap();
        let renewed = store.renew_lease(&run, "a", ttl, at(10)).await.unwrap();
        assert_eq!(renewed.expires_at, at(40));

        let err = store.renew_lease(&run, "b", ttl, at(11)).await.unwrap_err();
        assert!(matches!(err, StoreError::LeaseHeld { owner, .. } if owner == "a"));

        // Expired leases pass to the next claimant, and the old owner can no
        // longer renew.
        store.acquire_lease(&run, "b", ttl, at(40)).await.unwrap();
        assert!(matches!(
            store.renew_lease(&run, "a", ttl, at(41)).await,
            Err(StoreError::LeaseHeld { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_grant_a_single_owner() {
        let (_dir, store) = store().await;
        let store = Arc::new(store);
        let ttl = Duration::from_secs(30);
        for trial in 0..50 {
            let run = RunId::new(format!("r{trial}"));
            let claims: Vec<_> = ["a", "b"]
                .into_iter()
                .map(|owner| {
                    let store = store.clone();
                    let run = run.clone();
                    tokio::spawn(async move { store.acquire_lease(&run, owner, ttl, at(0)).await })
                })
                .collect();
            let mut granted = 0;
            for claim in claims {
                if claim.await.unwrap().is_ok() {
                    granted += 1;
                }
            }
            assert_eq!(granted, 1, "trial {trial}");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_terminal_updates_keep_the_first() {
        let (_dir, store) = store().await;
        let store = Arc::new(store);
        let sid = SessionId::from("s");
        store
            .create_session(&sid, at(1), SessionAttributes::default())
            .await
            .unwrap();
        for trial in 0..20 {
            let run = RunMeta::new(
                RunId::new(format!("r{trial}")),
                AgentId::from("a"),
                sid.clone(),
                at(1),
            )
            .with_status(RunStatus::Running, at(2));
            store.upsert_run(&run).await.unwrap();

            let updates: Vec<_> = [RunStatus::Completed, RunStatus::Canceled]
                .into_iter()
                .map(|status| {
                    let store = store.clone();
                    let meta = run.clone().with_status(status, at(3));
                    tokio::spawn(async move { store.upsert_run(&meta).await })
                })
                .collect();
            let mut applied = Vec::new();
            for update in updates {
                match update.await.unwrap() {
                    Ok(meta) => applied.push(meta.status),
                    Err(e) => assert!(matches!(e, StoreError::RunTerminal { .. })),
                }
            }
            assert_eq!(applied.len(), 1, "trial {trial}");
            let stored = store.load_run(&run.run_id).await.unwrap();
            assert_eq!(stored.status, applied[0]);
        }
    }
}
