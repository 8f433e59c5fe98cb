//! Error types for checkpoint operations
//!
//! Every backend reports failures through [`CheckpointError`]. The engine treats all of
//! them as non-fatal: a failed write is logged and execution continues, a failed read
//! means the session starts from its input.

use thiserror::Error;

/// Result type for checkpoint operations
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors produced by checkpoint stores
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// No checkpoint exists for the session
    #[error("Checkpoint not found for session '{0}'")]
    NotFound(String),

    /// Record could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem failure in the file backend
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend-specific storage failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Stored record is malformed (wrong session, version regression, ...)
    #[error("Invalid checkpoint: {0}")]
    Invalid(String),

    /// Backend cannot be reached or was not compiled in
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

impl CheckpointError {
    /// Build a storage error from any displayable source
    pub fn storage(error: impl std::fmt::Display) -> Self {
        Self::Storage(error.to_string())
    }

    /// True when the error only means "nothing saved yet"
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for CheckpointError {
    fn from(error: redis::RedisError) -> Self {
        if error.is_connection_refusal() || error.is_timeout() || error.is_io_error() {
            Self::Unavailable(error.to_string())
        } else {
            Self::Storage(error.to_string())
        }
    }
}
