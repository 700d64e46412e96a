use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for job engine operations
pub type JobsResult<T> = Result<T, JobsError>;

/// Errors surfaced by the store, queue, coordinator and publisher
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobsError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobsError {
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn not_found<S: Into<String>>(id: S) -> Self {
        Self::NotFound(id.into())
    }

    pub fn conflict<S: Into<String>>(message: S) -> Self {
        Self::Conflict(message.into())
    }

    pub fn unavailable<S: Into<String>>(message: S) -> Self {
        Self::Unavailable(message.into())
    }

    /// The user-visible kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Processing(_) | Self::Internal(_) => ErrorKind::ProcessingError,
            Self::Unavailable(_) => ErrorKind::Unavailable,
        }
    }

    /// Whether the coordinator's retry policy applies to this error
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl From<serde_json::Error> for JobsError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("Serialization error: {}", err))
    }
}

impl From<std::io::Error> for JobsError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            _ => Self::Unavailable(err.to_string()),
        }
    }
}

/// Error kinds recorded on a job's `error` payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    Conflict,
    Timeout,
    ProcessingError,
    Unavailable,
}

impl ErrorKind {
    /// Only transient kinds go through the retry policy
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::ProcessingError | Self::Unavailable)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid_argument",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Timeout => "timeout",
            Self::ProcessingError => "processing_error",
            Self::Unavailable => "unavailable",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Failure returned by a unit-of-work processor
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnitError {
    /// The unit failed; retried while attempts remain
    #[error("Processing failed: {0}")]
    Processing(String),

    /// A dependency was unreachable; retried while attempts remain
    #[error("Dependency unavailable: {0}")]
    Unavailable(String),

    /// The unit can never succeed; fails the job immediately
    #[error("Invalid unit: {0}")]
    Invalid(String),
}

impl UnitError {
    pub fn processing(msg: impl Into<String>) -> Self {
        Self::Processing(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Processing(_) => ErrorKind::ProcessingError,
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::Invalid(_) => ErrorKind::InvalidArgument,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Processing(msg) | Self::Unavailable(msg) | Self::Invalid(msg) => msg,
        }
    }
}
