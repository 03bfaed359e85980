//! Common error types for recordsync.

use thiserror::Error;

/// Top-level error type for sync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No response was received (connection refused, reset, DNS, ...).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The remote call did not complete in time.
    #[error("Operation timed out")]
    Timeout,

    /// The server answered a fetch with a structured error.
    #[error("Remote rejected request: {0}")]
    RemoteRejected(String),

    /// A cross-reference string could not be split into type and id.
    #[error("Malformed reference: {0}")]
    MalformedReference(String),

    /// A version tag could not be parsed.
    #[error("Unparsable version tag: {0}")]
    UnparsableVersionTag(String),

    /// The server response does not match what was sent.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The sync run was cancelled between two transport calls.
    #[error("Sync cancelled")]
    Cancelled,
}

impl Error {
    /// Whether re-issuing the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Timeout | Error::Io(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
