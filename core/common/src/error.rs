//! Common error types for TaskSync.

use thiserror::Error;

/// Top-level error type for TaskSync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Cryptographic operation failed.
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// The cryptographic primitive is not usable on this platform.
    #[error("Encryption unavailable: {0}")]
    CryptoUnavailable(String),

    /// Local storage (operation log or snapshot) failed.
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

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Transport-level failure talking to the remote.
    #[error("Network error: {0}")]
    Network(String),

    /// A remote call exceeded its time bound.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The remote rejected the request body as too large (HTTP 413).
    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    /// The remote rejected our credentials (HTTP 401).
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The remote does not implement the requested endpoint.
    #[error("Not supported by remote: {0}")]
    NotSupported(String),

    /// The operation was abandoned because its owner shut down.
    #[error("Cancelled")]
    Cancelled,

    /// Configuration is missing or violates its invariants.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A destructive remote operation failed half-way. The message tells the
    /// user what happened and how to recover.
    #[error("{0}")]
    Critical(String),
}

impl Error {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout(_) | Error::Io(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
