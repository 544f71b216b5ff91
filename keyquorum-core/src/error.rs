use thiserror::Error;

use crate::backend::BackendError;

/// Result type for approval workflow operations.
pub type Result<T, E = ApprovalError> = std::result::Result<T, E>;

/// Error outputs from the approval workflow.
#[derive(Debug, Error)]
pub enum ApprovalError {
    /// The `Type` field is missing or names a request kind that cannot be created.
    #[error("unsupported request type: {0}")]
    UnsupportedType(String),

    /// The submitted fields failed schema or variant-specific validation.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// Another operation currently holds the lock for this key.
    #[error("someone else is currently editing this request")]
    Conflict,

    /// No request is stored under the given identifier.
    #[error("change ID not found")]
    NotFound,

    /// A stored record carries a missing or unknown `Type`.
    #[error("invalid request type: {0}")]
    InvalidType(String),

    /// A stored record does not hash to the identifier it is stored under,
    /// or could not be decoded at all.
    #[error("request integrity check failed: {0}")]
    IntegrityFailure(String),

    /// The resource targeted by the request changed after it was proposed.
    #[error("stale request: {0}")]
    StaleRequest(String),

    /// A share was rejected by the backend while generating a root token.
    #[error("could not generate root token: {reason}{}", cancel_suffix(.cancel_failure.as_deref()))]
    InvalidShare {
        /// The backend's reason for refusing the share.
        reason: String,
        /// Set when cancelling the in-flight attempt failed as well.
        cancel_failure: Option<String>,
    },

    /// Every share was accepted but the backend did not produce a token.
    #[error("could not generate root token, quorum not reached (was the backend re-keyed?)")]
    QuorumNotReached,

    /// A wrapped share expired or was already consumed. Collection restarts from zero.
    #[error("one of the wrapping tokens timed out, progress reset: {0}")]
    ShareExpired(String),

    /// A root token was generated but could not be decoded. It may still be
    /// valid and must be found and revoked by an operator.
    #[error("CRITICAL: {0}")]
    Critical(String),

    /// Pass-through failure from the secret backend.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

fn cancel_suffix(cancel_failure: Option<&str>) -> String {
    cancel_failure.map_or_else(String::new, |err| {
        format!(". Attempted to cancel root generation, but: {err}")
    })
}

impl ApprovalError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::ValidationFailed(message.into())
    }

    pub(crate) fn integrity(message: impl Into<String>) -> Self {
        Self::IntegrityFailure(message.into())
    }

    pub(crate) fn stale(message: impl Into<String>) -> Self {
        Self::StaleRequest(message.into())
    }
}
