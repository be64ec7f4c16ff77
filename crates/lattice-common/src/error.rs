//! Error types for lattice collaborators.

use thiserror::Error;

/// Result type alias for collaborator operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced across collaborator boundaries (RPC, discovery, metadata).
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Remote call failed; callers on the write path retry these.
    #[error("RPC error: {0}")]
    Rpc(String),

    /// Target node or component is not reachable right now
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a caller may retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Rpc(_) | Error::Unavailable(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
