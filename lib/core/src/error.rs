use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Ledger already exists: {0}")]
    LedgerExists(String),

    #[error("Format error: {0}")]
    Format(String),

    #[error("Invalid vector dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("Upstream failure: {0}")]
    Upstream(String),

    #[error("Timed out after {elapsed_ms}ms: {operation}")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Rebuild already in progress for feature set {0}")]
    RebuildInProgress(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Stable, serializable classification of an [`Error`].
///
/// Reports and API responses carry the kind instead of an opaque failure string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    LedgerExists,
    Format,
    InvalidDimension,
    Upstream,
    Timeout,
    Cancelled,
    InvariantViolation,
    RebuildInProgress,
    InvalidRequest,
    Storage,
    Io,
    Serialization,
    InvalidConfig,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::LedgerExists(_) => ErrorKind::LedgerExists,
            Error::Format(_) => ErrorKind::Format,
            Error::InvalidDimension { .. } => ErrorKind::InvalidDimension,
            Error::Upstream(_) => ErrorKind::Upstream,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::InvariantViolation(_) => ErrorKind::InvariantViolation,
            Error::RebuildInProgress(_) => ErrorKind::RebuildInProgress,
            Error::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Error::Storage(_) => ErrorKind::Storage,
            Error::Io(_) => ErrorKind::Io,
            Error::Serialization(_) => ErrorKind::Serialization,
            Error::InvalidConfig(_) => ErrorKind::InvalidConfig,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
