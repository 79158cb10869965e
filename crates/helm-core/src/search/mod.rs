//! Read-only queries over sessions and failed tool results.

mod cursor;
mod service;

pub use cursor::{PageCursor, SearchError};
pub use service::{FailurePage, SearchService, SessionPage};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::{Session, StoreError};
use crate::types::{AgentId, EventId, RunId, SessionId};
use helm_tools::ResultCode;

/// Half-open time interval `[from, to)`; open ends are unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from.is_none_or(|from| at >= from) && self.to.is_none_or(|to| at < to)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionFilter {
    #[serde(default)]
    pub org_ids: Vec<String>,
    #[serde(default)]
    pub agent_ids: Vec<String>,
    #[serde(default)]
    pub principal_ids: Vec<String>,
    #[serde(default)]
    pub created_range: Option<TimeRange>,
    #[serde(default)]
    pub last_event_range: Option<TimeRange>,
    #[serde(default)]
    pub include_deleted: bool,
}

fn matches_any(values: &[String], candidate: Option<&String>) -> bool {
    values.is_empty() || candidate.is_some_and(|c| values.contains(c))
}

impl SessionFilter {
    pub fn matches(&self, session: &Session) -> bool {
        let attrs = &session.attributes;
        (self.include_deleted || session.deleted_at.is_none())
            && matches_any(&self.org_ids, attrs.org_id.as_ref())
            && matches_any(&self.agent_ids, attrs.agent_id.as_ref())
            && matches_any(&self.principal_ids, attrs.principal_id.as_ref())
            && self
                .created_range
                .is_none_or(|r| r.contains(session.created_at))
            && self
                .last_event_range
                .is_none_or(|r| session.last_event_at.is_some_and(|at| r.contains(at)))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionSortField {
    #[default]
    CreatedAt,
    LastEventAt,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSort {
    pub field: SessionSortField,
    pub order: SortOrder,
}

impl SessionSort {
    pub fn new(field: SessionSortField, order: SortOrder) -> Self {
        Self { field, order }
    }

    pub fn sort_value(&self, session: &Session) -> DateTime<Utc> {
        match self.field {
            SessionSortField::CreatedAt => session.created_at,
            SessionSortField::LastEventAt => session.last_activity(),
        }
    }
}

/// Exclusive keyset position: `(sort value, document id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeekKey {
    pub sort_value: DateTime<Utc>,
    pub id: String,
}

impl SeekKey {
    /// Whether `(value, id)` sorts strictly after this key in `order`.
    pub fn precedes(&self, value: DateTime<Utc>, id: &str, order: SortOrder) -> bool {
        let key = (self.sort_value, self.id.as_str());
        match order {
            SortOrder::Asc => (value, id) > key,
            SortOrder::Desc => (value, id) < key,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureFilter {
    #[serde(default)]
    pub org_ids: Vec<String>,
    #[serde(default)]
    pub agent_ids: Vec<String>,
    #[serde(default)]
    pub tool_names: Vec<String>,
    #[serde(default)]
    pub result_codes: Vec<ResultCode>,
    #[serde(default)]
    pub occurred_range: Option<TimeRange>,
}

impl FailureFilter {
    pub fn matches(&self, failure: &FailureRecord) -> bool {
        !failure.result_code.is_ok()
            && matches_any(&self.org_ids, failure.org_id.as_ref())
            && (self.agent_ids.is_empty() || self.agent_ids.contains(&failure.agent_id.0))
            && (self.tool_names.is_empty() || self.tool_names.contains(&failure.tool_name))
            && (self.result_codes.is_empty() || self.result_codes.contains(&failure.result_code))
            && self
                .occurred_range
                .is_none_or(|r| r.contains(failure.occurred_at))
    }
}

/// A `tool_result` event whose result code is not `ok`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub id: EventId,
    pub run_id: RunId,
    pub session_id: SessionId,
    pub agent_id: AgentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    pub tool_name: String,
    pub result_code: ResultCode,
    pub occurred_at: DateTime<Utc>,
    pub sequence: u64,
    pub result: Value,
}

/// Storage-side query capability behind `SearchService`.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Sessions matching `filter`, ordered by `sort` then id, strictly after
    /// `after`, at most `limit`.
    async fn query_sessions(
        &self,
        filter: &SessionFilter,
        sort: SessionSort,
        after: Option<&SeekKey>,
        limit: usize,
    ) -> Result<Vec<Session>, StoreError>;

    /// Failures ordered by `occurred_at desc, id desc`, strictly after `after`.
    async fn query_failures(
        &self,
        filter: &FailureFilter,
        after: Option<&SeekKey>,
        limit: usize,
    ) -> Result<Vec<FailureRecord>, StoreError>;
}
