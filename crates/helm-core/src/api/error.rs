use thiserror::Error;

use helm_tools::ErrorKind;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("Rate limited by {provider}: {details}")]
    RateLimited { provider: String, details: String },

    #[error("{provider} is unavailable: {details}")]
    Unavailable { provider: String, details: String },

    #[error("{provider} server error (Status: {status_code}): {details}")]
    ServerError {
        provider: String,
        status_code: u16,
        details: String,
    },

    #[error("Request timed out for {provider}")]
    Timeout { provider: String },

    #[error("Request rejected by {provider}: {details}")]
    Rejected { provider: String, details: String },

    #[error("Invalid request to {provider}: {details}")]
    InvalidRequest { provider: String, details: String },

    #[error("Request cancelled for {provider}")]
    Cancelled { provider: String },

    #[error("Stream error from {provider}: {details}")]
    StreamError { provider: String, details: String },

    #[error("{provider} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        provider: String,
        attempts: u32,
        last: Box<ApiError>,
    },
}

impl ApiError {
    pub fn provider(&self) -> &str {
        match self {
            ApiError::RateLimited { provider, .. }
            | ApiError::Unavailable { provider, .. }
            | ApiError::ServerError { provider, .. }
            | ApiError::Timeout { provider }
            | ApiError::Rejected { provider, .. }
            | ApiError::InvalidRequest { provider, .. }
            | ApiError::Cancelled { provider }
            | ApiError::StreamError { provider, .. }
            | ApiError::RetriesExhausted { provider, .. } => provider,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::RateLimited { .. }
            | ApiError::Unavailable { .. }
            | ApiError::ServerError { .. }
            | ApiError::Timeout { .. } => ErrorKind::Transient,
            ApiError::InvalidRequest { .. } => ErrorKind::Invalid,
            ApiError::Cancelled { .. } => ErrorKind::Canceled,
            ApiError::Rejected { .. }
            | ApiError::StreamError { .. }
            | ApiError::RetriesExhausted { .. } => ErrorKind::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn provider() -> String {
        "scripted".to_string()
    }

    #[rstest]
    #[case(ApiError::RateLimited { provider: provider(), details: "slow down".into() }, ErrorKind::Transient)]
    #[case(ApiError::ServerError { provider: provider(), status_code: 503, details: String::new() }, ErrorKind::Transient)]
    #[case(ApiError::Rejected { provider: provider(), details: "policy".into() }, ErrorKind::Permanent)]
    #[case(ApiError::InvalidRequest { provider: provider(), details: "bad".into() }, ErrorKind::Invalid)]
    #[case(ApiError::Cancelled { provider: provider() }, ErrorKind::Canceled)]
    fn maps_errors_to_kinds(#[case] error: ApiError, #[case] kind: ErrorKind) {
        assert_eq!(error.kind(), kind);
        assert_eq!(error.provider(), "scripted");
    }

    #[test]
    fn exhausted_retries_are_permanent() {
        let error = ApiError::RetriesExhausted {
            provider: provider(),
            attempts: 3,
            last: Box::new(ApiError::Timeout {
                provider: provider(),
            }),
        };
        assert!(!error.is_retryable());
        assert_eq!(
            error.to_string(),
            "scripted failed after 3 attempts: Request timed out for scripted"
        );
    }
}
