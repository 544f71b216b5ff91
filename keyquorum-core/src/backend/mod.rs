//! Secret backend interfaces.
//!
//! The approval workflow never talks to a secret-management server directly.
//! Everything it needs is abstracted behind three traits:
//!
//! - [`SecretStore`]: The service's private key/value namespace plus
//!   single-use response wrapping
//! - [`RootGenerator`]: The backend's quorum root-generation protocol
//! - [`PolicyAdmin`]: Reading and changing the policies requests target
//!
//! [`Backend`] bundles all three and is implemented automatically for any
//! type that implements them. [`memory::MemoryBackend`] is an in-memory
//! implementation for tests.

mod error;
pub mod memory;

use std::fmt;
use std::time::Duration;

use secrecy::SecretString;

pub use error::{BackendError, BackendResult};

/// Untyped record fields as exchanged with the backend.
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// Identity of the party invoking an operation.
///
/// The workflow does not authenticate callers. The identifier is recorded
/// (for example in an approver set) and the token is handed to the backend,
/// which makes every authorization decision.
pub struct Caller {
    id: String,
    token: SecretString,
}

impl Caller {
    /// Creates a caller from a display identifier and a backend token.
    #[must_use]
    pub fn new(id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            token: SecretString::from(token.into()),
        }
    }

    /// The caller's stable identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The caller's backend token. Treat as sensitive.
    #[must_use]
    pub const fn token(&self) -> &SecretString {
        &self.token
    }
}

impl fmt::Debug for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Caller").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Identity under which a privileged change is applied.
#[derive(Debug, Clone, Copy)]
pub enum Authority<'a> {
    /// The workflow service's own backend identity.
    Service,
    /// A freshly reconstructed root credential.
    Root(&'a SecretString),
}

/// Snapshot of the backend's root-generation protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RootGenerationStatus {
    /// Whether an attempt is in flight.
    pub started: bool,
    /// Nonce identifying the in-flight attempt.
    pub nonce: String,
    /// Number of shares accepted so far.
    pub progress: usize,
    /// Number of shares needed to complete an attempt.
    pub required: usize,
    /// `base64(token XOR otp)` once the attempt completed.
    pub encoded_root_token: Option<String>,
}

/// Private key/value storage and response wrapping.
pub trait SecretStore: Send + Sync {
    /// Reads the record at `path`, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn read(&self, path: &str) -> BackendResult<Option<Fields>>;

    /// Writes (replaces) the record at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn write(&self, path: &str, fields: Fields) -> BackendResult<()>;

    /// Deletes the record at `path`. Deleting a missing record is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    fn delete(&self, path: &str) -> BackendResult<()>;

    /// Wraps `payload` behind a single-use token valid for `ttl`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend refuses to wrap the payload.
    fn wrap(&self, ttl: Duration, payload: Fields) -> BackendResult<String>;

    /// Redeems a wrapping token, returning the wrapped payload.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::TokenExpired`] if the token expired or was
    /// already redeemed.
    fn unwrap(&self, token: &str) -> BackendResult<Fields>;
}

/// Quorum root-generation protocol.
pub trait RootGenerator: Send + Sync {
    /// Returns the current protocol status.
    ///
    /// # Errors
    ///
    /// Returns an error if the status cannot be read.
    fn generate_root_status(&self) -> BackendResult<RootGenerationStatus>;

    /// Starts an attempt bound to the base64-encoded one-time pad `otp`.
    ///
    /// # Errors
    ///
    /// Returns an error if an attempt is already running or the backend fails.
    fn generate_root_init(&self, otp: &str) -> BackendResult<RootGenerationStatus>;

    /// Supplies one share to the attempt identified by `nonce`.
    ///
    /// # Errors
    ///
    /// Returns an error if the share or nonce is refused.
    fn generate_root_update(
        &self,
        share: &SecretString,
        nonce: &str,
    ) -> BackendResult<RootGenerationStatus>;

    /// Cancels the in-flight attempt.
    ///
    /// # Errors
    ///
    /// Returns an error if cancellation fails.
    fn generate_root_cancel(&self) -> BackendResult<()>;
}

/// Administration of the policies that requests propose to change.
pub trait PolicyAdmin: Send + Sync {
    /// Reads a policy document using the caller's own identity.
    ///
    /// Returns `Ok(None)` if the policy does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::PermissionDenied`] if the caller may not view
    /// the policy.
    fn read_policy(&self, caller: &Caller, name: &str) -> BackendResult<Option<String>>;

    /// Creates or replaces a policy document.
    ///
    /// # Errors
    ///
    /// Returns an error if `authority` may not write policies.
    fn write_policy(&self, authority: Authority<'_>, name: &str, document: &str)
        -> BackendResult<()>;

    /// Deletes a policy.
    ///
    /// # Errors
    ///
    /// Returns an error if `authority` may not delete policies.
    fn delete_policy(&self, authority: Authority<'_>, name: &str) -> BackendResult<()>;

    /// Revokes a token so it can no longer be used.
    ///
    /// # Errors
    ///
    /// Returns an error if revocation fails.
    fn revoke_token(&self, token: &SecretString) -> BackendResult<()>;
}

/// Everything the workflow needs from a secret backend.
pub trait Backend: SecretStore + RootGenerator + PolicyAdmin {}

impl<T> Backend for T where T: SecretStore + RootGenerator + PolicyAdmin {}
