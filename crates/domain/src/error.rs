use serde::{Deserialize, Serialize};
use std::fmt;

/// Shared error type used across all nanoagent crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Connection-level failure (DNS, TLS, reset, body read).
    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    /// The provider answered with a non-success status or an unparseable body.
    #[error("provider {provider}: {message}")]
    Provider {
        provider: String,
        status: Option<u16>,
        message: String,
    },

    #[error("config: {0}")]
    Config(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether a provider call that failed with this error may be retried.
    ///
    /// Network failures, timeouts, 5xx and 429 are transient. Everything
    /// else (auth, 4xx validation, config) is fatal.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Timeout(_) | Error::Http(_) => true,
            Error::Provider { status: Some(s), .. } => *s >= 500 || *s == 429,
            _ => false,
        }
    }

    /// Map this error into the engine's wire taxonomy.
    pub fn kind(&self) -> ErrorKind {
        if self.is_transient() {
            ErrorKind::TransientProvider
        } else {
            ErrorKind::FatalProvider
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error taxonomy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Classification carried by tool results and terminal loop failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    TransientProvider,
    FatalProvider,
    ToolTimeout,
    ToolValidation,
    SandboxViolation,
    IterationCapExceeded,
    ToolServerUnavailable,
    ToolNotFound,
    ToolExecution,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransientProvider => "transient-provider",
            ErrorKind::FatalProvider => "fatal-provider",
            ErrorKind::ToolTimeout => "tool-timeout",
            ErrorKind::ToolValidation => "tool-validation",
            ErrorKind::SandboxViolation => "sandbox-violation",
            ErrorKind::IterationCapExceeded => "iteration-cap-exceeded",
            ErrorKind::ToolServerUnavailable => "tool-server-unavailable",
            ErrorKind::ToolNotFound => "tool-not-found",
            ErrorKind::ToolExecution => "tool-execution",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by a tool invoker. Always becomes a tool-result turn.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ToolError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ToolError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ToolValidation, message)
    }

    pub fn sandbox(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SandboxViolation, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ToolTimeout, message)
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ToolExecution, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ToolServerUnavailable, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(status: Option<u16>) -> Error {
        Error::Provider {
            provider: "openai".into(),
            status,
            message: "boom".into(),
        }
    }

    #[test]
    fn server_errors_and_rate_limits_are_transient() {
        assert!(provider(Some(500)).is_transient());
        assert!(provider(Some(503)).is_transient());
        assert!(provider(Some(429)).is_transient());
        assert!(Error::Timeout("slow".into()).is_transient());
        assert!(Error::Http("connection reset".into()).is_transient());
    }

    #[test]
    fn auth_and_validation_errors_are_fatal() {
        assert!(!provider(Some(401)).is_transient());
        assert!(!provider(Some(400)).is_transient());
        assert!(!provider(None).is_transient());
        assert!(!Error::Auth("no key".into()).is_transient());
        assert_eq!(provider(Some(403)).kind(), ErrorKind::FatalProvider);
    }

    #[test]
    fn error_kind_serializes_kebab_case() {
        let json = serde_json::to_string(&ErrorKind::ToolServerUnavailable).unwrap();
        assert_eq!(json, "\"tool-server-unavailable\"");
        assert_eq!(ErrorKind::IterationCapExceeded.to_string(), "iteration-cap-exceeded");
    }
}
