use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::cursor::{PageCursor, SearchError};
use super::{
    FailureFilter, FailureRecord, SearchIndex, SeekKey, SessionFilter, SessionSort,
    SessionSortField, SortOrder,
};
use crate::config::SearchConfig;
use crate::session::Session;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPage {
    pub sessions: Vec<Session>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailurePage {
    pub failures: Vec<FailureRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

pub struct SearchService {
    index: Arc<dyn SearchIndex>,
    config: SearchConfig,
}

impl SearchService {
    pub fn new(index: Arc<dyn SearchIndex>, config: SearchConfig) -> Self {
        Self { index, config }
    }

    fn page_size(&self, limit: Option<usize>) -> usize {
        limit
            .unwrap_or(self.config.default_page_size)
            .clamp(1, self.config.max_page_size.max(1))
    }

    #[instrument(skip(self, filter, cursor), fields(sort = ?sort))]
    pub async fn search_sessions(
        &self,
        filter: &SessionFilter,
        sort: SessionSort,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> Result<SessionPage, SearchError> {
        let scope = session_scope(sort);
        let after = cursor
            .map(|token| PageCursor::decode(token, &scope))
            .transpose()?;
        let limit = self.page_size(limit);

        let mut sessions = self
            .index
            .query_sessions(filter, sort, after.as_ref(), limit + 1)
            .await?;

        let next_cursor = if sessions.len() > limit {
            sessions.truncate(limit);
            sessions
                .last()
                .map(|last| {
                    PageCursor::new(
                        scope.clone(),
                        &SeekKey {
                            sort_value: sort.sort_value(last),
                            id: last.id.to_string(),
                        },
                    )
                    .encode()
                })
                .transpose()?
        } else {
            None
        };

        debug!(
            target: "helm::search",
            returned = sessions.len(),
            has_more = next_cursor.is_some(),
            "Session search"
        );
        Ok(SessionPage {
            sessions,
            next_cursor,
        })
    }

    #[instrument(skip(self, filter, cursor))]
    pub async fn search_failures(
        &self,
        filter: &FailureFilter,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> Result<FailurePage, SearchError> {
        let after = cursor
            .map(|token| PageCursor::decode(token, FAILURE_SCOPE))
            .transpose()?;
        let limit = self.page_size(limit);

        let mut failures = self
            .index
            .query_failures(filter, after.as_ref(), limit + 1)
            .await?;

        let next_cursor = if failures.len() > limit {
            failures.truncate(limit);
            failures
                .last()
                .map(|last| {
                    PageCursor::new(
                        FAILURE_SCOPE,
                        &SeekKey {
                            sort_value: last.occurred_at,
                            id: last.id.to_string(),
                        },
                    )
                    .encode()
                })
                .transpose()?
        } else {
            None
        };

        debug!(
            target: "helm::search",
            returned = failures.len(),
            has_more = next_cursor.is_some(),
            "Failure search"
        );
        Ok(FailurePage {
            failures,
            next_cursor,
        })
    }
}

const FAILURE_SCOPE: &str = "failures:occurredAt:desc";

fn session_scope(sort: SessionSort) -> String {
    let field = match sort.field {
        SessionSortField::CreatedAt => "createdAt",
        SessionSortField::LastEventAt => "lastEventAt",
    };
    let order = match sort.order {
        SortOrder::Asc => "asc",
        SortOrder::Desc => "desc",
    };
    format!("sessions:{field}:{order}")
}
