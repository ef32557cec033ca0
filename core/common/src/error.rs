//! Common error types for listshare.

use thiserror::Error;

/// Top-level error type for content sharing operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No user identity is available for an operation that needs one.
    #[error("Not authenticated: {0}")]
    NotAuthenticated(String),

    /// A local id referenced an entity that does not exist.
    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    /// The operation needs the entity to be shared first.
    #[error("Not shared: {0}")]
    NotShared(String),

    /// The remote sharing store rejected or failed an operation.
    #[error("Remote operation failed: {0}")]
    RemoteOperationFailed(String),

    /// Local persistence (queue or id store) failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A background task the caller talks to is no longer running.
    #[error("Channel closed: {0}")]
    Channel(String),
}

impl Error {
    /// Whether this error came from the remote side and is worth retrying.
    pub fn is_remote(&self) -> bool {
        matches!(self, Error::RemoteOperationFailed(_))
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
