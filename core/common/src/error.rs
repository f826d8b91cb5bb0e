//! Common error types for offgrid.

use thiserror::Error;

/// Top-level error type for offgrid operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Network fetch failed or timed out.
    #[error("Network unavailable: {0}")]
    Network(String),

    /// Persistence read or write failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The delivery capability rejected or failed to send an item.
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A channel or background task is no longer running.
    #[error("Closed: {0}")]
    Closed(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
