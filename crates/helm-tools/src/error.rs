use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification shared by every error in the runtime.
///
/// Call sites decide retry and propagation from the kind alone, never from
/// the concrete variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Invalid,
    Conflict,
    Transient,
    Permanent,
    Canceled,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Invalid => "invalid",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome code recorded on every `tool_result` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    Ok,
    Denied,
    InvalidPayload,
    UnknownTool,
    BackendError,
    Timeout,
    Canceled,
    AdapterFailure,
}

impl ResultCode {
    pub fn is_ok(self) -> bool {
        matches!(self, ResultCode::Ok)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResultCode::Ok => "ok",
            ResultCode::Denied => "denied",
            ResultCode::InvalidPayload => "invalid_payload",
            ResultCode::UnknownTool => "unknown_tool",
            ResultCode::BackendError => "backend_error",
            ResultCode::Timeout => "timeout",
            ResultCode::Canceled => "canceled",
            ResultCode::AdapterFailure => "adapter_failure",
        }
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResultCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(ResultCode::Ok),
            "denied" => Ok(ResultCode::Denied),
            "invalid_payload" => Ok(ResultCode::InvalidPayload),
            "unknown_tool" => Ok(ResultCode::UnknownTool),
            "backend_error" => Ok(ResultCode::BackendError),
            "timeout" => Ok(ResultCode::Timeout),
            "canceled" => Ok(ResultCode::Canceled),
            "adapter_failure" => Ok(ResultCode::AdapterFailure),
            other => Err(format!("unknown result code: {other}")),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum ToolError {
    #[error("Unknown tool: {tool_name}")]
    UnknownTool { tool_name: String },

    #[error("Invalid payload for {tool_name}: {message}")]
    InvalidPayload { tool_name: String, message: String },

    #[error("{tool_name} was declined")]
    ConfirmationDenied { tool_name: String },

    #[error("{tool_name} failed: {message}")]
    Backend {
        tool_name: String,
        message: String,
        retryable: bool,
    },

    #[error("{tool_name} timed out")]
    Timeout { tool_name: String },

    #[error("{tool_name} was cancelled")]
    Cancelled { tool_name: String },

    #[error("Adapter failure for {tool_name}: {message}")]
    Adapter { tool_name: String, message: String },
}

impl ToolError {
    pub fn unknown(tool_name: impl Into<String>) -> Self {
        Self::UnknownTool {
            tool_name: tool_name.into(),
        }
    }

    pub fn invalid_payload(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidPayload {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    pub fn retryable(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            tool_name: tool_name.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn terminal(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            tool_name: tool_name.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn adapter(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Adapter {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    pub fn tool_name(&self) -> &str {
        match self {
            ToolError::UnknownTool { tool_name }
            | ToolError::InvalidPayload { tool_name, .. }
            | ToolError::ConfirmationDenied { tool_name }
            | ToolError::Backend { tool_name, .. }
            | ToolError::Timeout { tool_name }
            | ToolError::Cancelled { tool_name }
            | ToolError::Adapter { tool_name, .. } => tool_name,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ToolError::UnknownTool { .. } => ErrorKind::NotFound,
            ToolError::InvalidPayload { .. } => ErrorKind::Invalid,
            ToolError::ConfirmationDenied { .. } => ErrorKind::Conflict,
            ToolError::Backend { retryable, .. } => {
                if *retryable {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Permanent
                }
            }
            ToolError::Timeout { .. } => ErrorKind::Transient,
            ToolError::Cancelled { .. } => ErrorKind::Canceled,
            ToolError::Adapter { .. } => ErrorKind::Permanent,
        }
    }

    /// Only retryable backend failures are eligible for engine-level retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ToolError::Backend {
                retryable: true,
                ..
            }
        )
    }

    pub fn result_code(&self) -> ResultCode {
        match self {
            ToolError::UnknownTool { .. } => ResultCode::UnknownTool,
            ToolError::InvalidPayload { .. } => ResultCode::InvalidPayload,
            ToolError::ConfirmationDenied { .. } => ResultCode::Denied,
            ToolError::Backend { .. } => ResultCode::BackendError,
            ToolError::Timeout { .. } => ResultCode::Timeout,
            ToolError::Cancelled { .. } => ResultCode::Canceled,
            ToolError::Adapter { .. } => ResultCode::AdapterFailure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ToolError::unknown("a.b"), ErrorKind::NotFound, ResultCode::UnknownTool)]
    #[case(ToolError::invalid_payload("a.b", "x"), ErrorKind::Invalid, ResultCode::InvalidPayload)]
    #[case(ToolError::retryable("a.b", "x"), ErrorKind::Transient, ResultCode::BackendError)]
    #[case(ToolError::terminal("a.b", "x"), ErrorKind::Permanent, ResultCode::BackendError)]
    #[case(ToolError::Timeout { tool_name: "a.b".into() }, ErrorKind::Transient, ResultCode::Timeout)]
    #[case(ToolError::Cancelled { tool_name: "a.b".into() }, ErrorKind::Canceled, ResultCode::Canceled)]
    fn classifies_tool_errors(
        #[case] error: ToolError,
        #[case] kind: ErrorKind,
        #[case] code: ResultCode,
    ) {
        assert_eq!(error.kind(), kind);
        assert_eq!(error.result_code(), code);
        assert_eq!(error.tool_name(), "a.b");
    }

    #[test]
    fn only_retryable_backend_errors_are_retried() {
        assert!(ToolError::retryable("t", "busy").is_retryable());
        assert!(!ToolError::terminal("t", "broken").is_retryable());
        assert!(!ToolError::Timeout { tool_name: "t".into() }.is_retryable());
    }

    #[test]
    fn result_code_parses_its_own_display() {
        for code in [
            ResultCode::Ok,
            ResultCode::Denied,
            ResultCode::BackendError,
            ResultCode::AdapterFailure,
        ] {
            assert_eq!(code.to_string().parse::<ResultCode>(), Ok(code));
        }
        assert!("bogus".parse::<ResultCode>().is_err());
    }
}
