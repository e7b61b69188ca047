use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Infrastructure errors for queue operations.
///
/// Job-level failures never show up here: they are values ([`JobFailure`])
/// that drive the retry/dead-letter transition instead.
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    #[error("Cannot reach priority store: {0}")]
    Connection(String),

    #[error("Priority store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Queue is closed: {0}")]
    QueueClosed(String),

    #[error("Queue already open: {0}")]
    QueueAlreadyOpen(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Worker shutdown failed: {0}")]
    WorkerShutdown(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
            Self::Connection(err.to_string())
        } else {
            Self::Store(err.to_string())
        }
    }
}

/// Failure category for dead-letter triage.
///
/// Set by the failing caller. Only used for statistics and operator
/// visibility; retry policy is governed by the `retryable` flag alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Connection,
    ApiError,
    Validation,
    Other,
}

impl ErrorKind {
    /// All categories in reporting order
    pub fn all() -> &'static [ErrorKind] {
        &[
            Self::Timeout,
            Self::Connection,
            Self::ApiError,
            Self::Validation,
            Self::Other,
        ]
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connection => "connection",
            Self::ApiError => "api_error",
            Self::Validation => "validation",
            Self::Other => "other",
        }
    }
}

impl Default for ErrorKind {
    fn default() -> Self {
        Self::Other
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "timeout" => Ok(Self::Timeout),
            "connection" => Ok(Self::Connection),
            "api_error" => Ok(Self::ApiError),
            "validation" => Ok(Self::Validation),
            "other" => Ok(Self::Other),
            _ => Err(format!("Invalid error kind: {}", s)),
        }
    }
}

/// Why a job failed: a category plus a human-readable detail.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct JobFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    pub fn api_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ApiError, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Other, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ApiError).unwrap();
        assert_eq!(json, "\"api_error\"");

        let kind: ErrorKind = serde_json::from_str("\"timeout\"").unwrap();
        assert_eq!(kind, ErrorKind::Timeout);
    }

    #[test]
    fn test_error_kind_from_str() {
        assert_eq!("Validation".parse::<ErrorKind>(), Ok(ErrorKind::Validation));
        assert!("bogus".parse::<ErrorKind>().is_err());
    }

    #[test]
    fn test_job_failure_display() {
        let failure = JobFailure::connection("marketplace unreachable");
        assert_eq!(failure.to_string(), "connection: marketplace unreachable");
    }
}
