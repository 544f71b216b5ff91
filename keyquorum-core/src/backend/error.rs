//! Error types for secret backend adapters.

use thiserror::Error;

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors raised by a secret backend adapter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The caller's identity is not allowed to perform the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The addressed object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A wrapping token expired or was already unwrapped.
    #[error("wrapping token expired or already used")]
    TokenExpired,

    /// A share was refused by the root-generation protocol.
    #[error("invalid share: {0}")]
    InvalidShare(String),

    /// A root-generation attempt is already in flight on the backend.
    #[error("root generation already in progress")]
    RootGenerationInProgress,

    /// An update or cancel was issued with no attempt in flight.
    #[error("no root generation in progress")]
    NoRootGeneration,

    /// Payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The backend could not be reached or failed internally.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}
