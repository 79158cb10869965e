use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::SeekKey;
use crate::session::StoreError;
use helm_tools::ErrorKind;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("Invalid cursor: {message}")]
    InvalidCursor { message: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SearchError {
    pub fn invalid_cursor(message: impl Into<String>) -> Self {
        Self::InvalidCursor {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SearchError::InvalidCursor { .. } => ErrorKind::Invalid,
            SearchError::Store(e) => e.kind(),
        }
    }
}

/// Opaque continuation token. `scope` binds the cursor to the query shape
/// (e.g. `sessions:createdAt:desc`) it was issued for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCursor {
    #[serde(rename = "k")]
    pub scope: String,
    #[serde(rename = "v")]
    pub sort_value: DateTime<Utc>,
    #[serde(rename = "id")]
    pub id: String,
}

impl PageCursor {
    pub fn new(scope: impl Into<String>, key: &SeekKey) -> Self {
        Self {
            scope: scope.into(),
            sort_value: key.sort_value,
            id: key.id.clone(),
        }
    }

    pub fn encode(&self) -> Result<String, SearchError> {
        let json =
            serde_json::to_vec(self).map_err(|e| SearchError::invalid_cursor(e.to_string()))?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    pub fn decode(token: &str, expected_scope: &str) -> Result<SeekKey, SearchError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|e| SearchError::invalid_cursor(format!("not base64: {e}")))?;
        let cursor: PageCursor = serde_json::from_slice(&bytes)
            .map_err(|e| SearchError::invalid_cursor(format!("malformed: {e}")))?;
        if cursor.scope != expected_scope {
            return Err(SearchError::invalid_cursor(format!(
                "cursor was issued for {}, not {expected_scope}",
                cursor.scope
            )));
        }
        Ok(SeekKey {
            sort_value: cursor.sort_value,
            id: cursor.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn decodes_what_it_encodes() {
        let key = SeekKey {
            sort_value: Utc.timestamp_opt(20, 0).unwrap(),
            id: "s20".into(),
        };
        let token = PageCursor::new("sessions:createdAt:desc", &key)
            .encode()
            .unwrap();
        assert_eq!(
            PageCursor::decode(&token, "sessions:createdAt:desc").unwrap(),
            key
        );
    }

    #[test]
    fn rejects_foreign_or_garbled_cursors() {
        let key = SeekKey {
            sort_value: Utc.timestamp_opt(20, 0).unwrap(),
            id: "s20".into(),
        };
        let token = PageCursor::new("sessions:createdAt:desc", &key)
            .encode()
            .unwrap();
        let err = PageCursor::decode(&token, "sessions:createdAt:asc").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
        assert!(PageCursor::decode("!!!", "x").is_err());
    }
}
