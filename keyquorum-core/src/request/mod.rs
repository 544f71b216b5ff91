//! Request kinds and the capability set every kind implements.
//!
//! A stored request is an untyped record whose `Type` field names its kind.
//! [`RequestKind`] maps that field (case-insensitively) to a concrete
//! implementation of [`Request`]. Adding a kind means adding a variant and an
//! implementation; the service itself never inspects kind-specific fields.

mod policy;
pub mod schema;

use std::any::Any;
use std::fmt;

use secrecy::SecretString;
use strum::{Display, EnumString};

use crate::backend::{Backend, Caller, Fields};
use crate::config::WorkflowConfig;
use crate::error::Result;
use crate::fingerprint::Fingerprint;
use crate::locks::LockRegistry;
use crate::seal::ProgressKey;

pub use policy::PolicyRequest;

/// Name of the discriminator field in every request record.
pub const TYPE_FIELD: &str = "Type";

/// Name of the field holding a stored request's progress seal.
pub const SEAL_FIELD: &str = "ProgressSeal";

/// The request kinds this crate knows how to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum RequestKind {
    /// A proposed change to a named access policy.
    Policy,
}

impl RequestKind {
    /// Builds and validates a new request of this kind from caller input.
    ///
    /// # Errors
    ///
    /// Returns the kind's validation error if `raw` is not acceptable.
    pub fn create(
        self,
        ctx: &Context<'_>,
        caller: &Caller,
        raw: &Fields,
    ) -> Result<Box<dyn Request>> {
        match self {
            Self::Policy => Ok(Box::new(PolicyRequest::create(ctx, caller, raw)?)),
        }
    }

    /// Rebuilds a stored request of this kind.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::IntegrityFailure`](crate::ApprovalError::IntegrityFailure)
    /// if the record does not have this kind's shape.
    pub fn decode(self, fields: &Fields) -> Result<Box<dyn Request>> {
        match self {
            Self::Policy => Ok(Box::new(PolicyRequest::decode(fields)?)),
        }
    }
}

/// Returns the `Type` field if it is a non-empty string.
#[must_use]
pub fn type_field(fields: &Fields) -> Option<&str> {
    fields
        .get(TYPE_FIELD)
        .and_then(serde_json::Value::as_str)
        .filter(|t| !t.is_empty())
}

/// What an approval achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    /// The caller's approval was recorded; more are needed.
    Pending {
        /// Distinct approvers so far.
        approvals: usize,
        /// Approvers needed.
        required: usize,
    },
    /// The share was stored; more are needed before reconstruction.
    SharesPending {
        /// Shares collected so far.
        collected: usize,
        /// Shares the backend needs.
        required: usize,
    },
    /// The threshold was met, the change was applied and the request removed.
    Approved,
}

/// Collaborators available to a request while it runs.
#[derive(Clone, Copy)]
pub struct Context<'a> {
    backend: &'a dyn Backend,
    locks: &'a dyn LockRegistry,
    config: &'a WorkflowConfig,
    progress_key: &'a ProgressKey,
}

impl<'a> Context<'a> {
    /// Bundles the collaborators for one operation.
    #[must_use]
    pub fn new(
        backend: &'a dyn Backend,
        locks: &'a dyn LockRegistry,
        config: &'a WorkflowConfig,
        progress_key: &'a ProgressKey,
    ) -> Self {
        Self {
            backend,
            locks,
            config,
            progress_key,
        }
    }

    /// The secret backend.
    #[must_use]
    pub fn backend(&self) -> &'a dyn Backend {
        self.backend
    }

    /// The lock registry, used to serialize root generation.
    #[must_use]
    pub fn locks(&self) -> &'a dyn LockRegistry {
        self.locks
    }

    /// Workflow settings.
    #[must_use]
    pub const fn config(&self) -> &'a WorkflowConfig {
        self.config
    }

    /// Key that seals the approval progress of stored requests.
    #[must_use]
    pub const fn progress_key(&self) -> &'a ProgressKey {
        self.progress_key
    }

    /// Persists `request` under `fingerprint` together with the seal over its
    /// progress fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be serialized or written.
    pub fn store(&self, fingerprint: &Fingerprint, request: &dyn Request) -> Result<()> {
        let mut fields = request.to_fields()?;
        let seal = self
            .progress_key
            .seal(fingerprint, &fields, request.progress_fields())?;
        fields.insert(SEAL_FIELD.to_string(), serde_json::Value::String(seal));
        self.backend
            .write(&self.config.request_path(fingerprint.as_str()), fields)?;
        Ok(())
    }
}

impl fmt::Debug for Context<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("config", self.config)
            .finish_non_exhaustive()
    }
}

/// Capability set of a request kind.
///
/// The service holds the request's lock for the duration of every call.
pub trait Request: Send + Sync + fmt::Debug {
    /// Builds a new request from caller input, validating it against the
    /// current backend state.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::ValidationFailed`](crate::ApprovalError::ValidationFailed)
    /// if the input is malformed or the caller may not propose it.
    fn create(ctx: &Context<'_>, caller: &Caller, raw: &Fields) -> Result<Self>
    where
        Self: Sized;

    /// Rebuilds a request from its stored record.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::IntegrityFailure`](crate::ApprovalError::IntegrityFailure)
    /// if the record is malformed.
    fn decode(fields: &Fields) -> Result<Self>
    where
        Self: Sized;

    /// The request's kind.
    fn kind(&self) -> RequestKind;

    /// Whether the request can only be approved by collecting quorum shares.
    fn is_root_only(&self) -> bool;

    /// The record persisted for this request.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be serialized.
    fn to_fields(&self) -> Result<Fields>;

    /// Fields that record approval progress rather than the proposal itself.
    /// They may change while the request is pending, so they are left out of
    /// the fingerprint.
    fn progress_fields(&self) -> &'static [&'static str] {
        &[]
    }

    /// The request's identifier and integrity checksum.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be serialized.
    fn fingerprint(&self) -> Result<Fingerprint> {
        Ok(Fingerprint::of(&self.to_fields()?, self.progress_fields()))
    }

    /// Checks that the request still applies to the current backend state and
    /// that `caller` may see it.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::StaleRequest`](crate::ApprovalError::StaleRequest)
    /// if the target changed, or a backend error if the caller is refused.
    fn verify(&self, ctx: &Context<'_>, caller: &Caller) -> Result<()>;

    /// Records an approval, or a quorum share when `share` is set, applying
    /// the request once its threshold is met.
    ///
    /// # Errors
    ///
    /// Returns an error if the approval cannot be recorded or applied.
    fn approve(
        &self,
        ctx: &Context<'_>,
        caller: &Caller,
        fingerprint: &Fingerprint,
        share: Option<SecretString>,
    ) -> Result<ApprovalOutcome>;

    /// Discards the request after checking that `caller` may do so.
    ///
    /// # Errors
    ///
    /// Returns an error if the caller is refused or the delete fails.
    fn reject(&self, ctx: &Context<'_>, caller: &Caller, fingerprint: &Fingerprint) -> Result<()>;

    /// Downcasting hook for callers that know the concrete kind.
    fn as_any(&self) -> &dyn Any;
}

/// Returns whether `request` may only be approved with quorum shares.
#[must_use]
pub fn is_root_only(request: &dyn Request) -> bool {
    request.is_root_only()
}
