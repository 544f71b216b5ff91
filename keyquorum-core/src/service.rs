//! The approval dispatcher.
//!
//! [`ApprovalService`] is the entry point for the four request operations.
//! Every operation claims the request's fingerprint in the lock registry for
//! its whole duration and releases it on every exit path. Operations on a
//! request that is already being worked on fail with
//! [`ApprovalError::Conflict`] instead of waiting.

use std::fmt;
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};

use crate::backend::{Backend, Caller, Fields};
use crate::config::WorkflowConfig;
use crate::error::{ApprovalError, Result};
use crate::fingerprint::Fingerprint;
use crate::locks::{LockGuard, LockRegistry};
use crate::request::{type_field, ApprovalOutcome, Context, Request, RequestKind, SEAL_FIELD};
use crate::seal::ProgressKey;

/// Creates, fetches, approves and rejects requests against a secret backend.
///
/// The service is cheap to share between threads; all state lives in the
/// backend and the lock registry.
pub struct ApprovalService {
    backend: Arc<dyn Backend>,
    locks: Arc<dyn LockRegistry>,
    config: WorkflowConfig,
    progress_key: ProgressKey,
}

impl fmt::Debug for ApprovalService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApprovalService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ApprovalService {
    /// Creates a service. Approval progress is sealed with `progress_key`;
    /// requests recorded under a different key fail their integrity check.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::ValidationFailed`] if `config` is invalid.
    pub fn new(
        backend: Arc<dyn Backend>,
        locks: Arc<dyn LockRegistry>,
        config: WorkflowConfig,
        progress_key: ProgressKey,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            backend,
            locks,
            config,
            progress_key,
        })
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    fn context(&self) -> Context<'_> {
        Context::new(
            self.backend.as_ref(),
            self.locks.as_ref(),
            &self.config,
            &self.progress_key,
        )
    }

    /// Proposes a new request built from `raw` and returns its identifier.
    ///
    /// Proposing a request identical to one that is already pending returns
    /// the pending request's identifier and leaves it untouched.
    ///
    /// # Errors
    ///
    /// - [`ApprovalError::UnsupportedType`] if `Type` is missing or unknown.
    /// - [`ApprovalError::ValidationFailed`] if the request kind refuses `raw`.
    /// - [`ApprovalError::Conflict`] if the identifier is locked.
    /// - [`ApprovalError::IntegrityFailure`] if the pending request with this
    ///   identifier has been tampered with.
    pub fn add(&self, caller: &Caller, raw: &Fields) -> Result<Fingerprint> {
        let kind_name = type_field(raw)
            .ok_or_else(|| ApprovalError::UnsupportedType("missing Type field".to_string()))?;
        let kind: RequestKind = kind_name
            .parse()
            .map_err(|_| ApprovalError::UnsupportedType(kind_name.to_string()))?;

        let ctx = self.context();
        let request = kind.create(&ctx, caller, raw)?;
        let fingerprint = request.fingerprint()?;

        let _guard = LockGuard::claim(self.locks.as_ref(), fingerprint.as_str())?;
        let path = self.config.request_path(fingerprint.as_str());
        if let Some(existing) = self.backend.read(&path)? {
            Self::check_integrity(&ctx, &fingerprint, existing)?;
            log::info!("{kind} request {fingerprint} is already pending");
            return Ok(fingerprint);
        }
        ctx.store(&fingerprint, request.as_ref())?;

        log::info!("{} proposed {kind} request {fingerprint}", caller.id());
        Ok(fingerprint)
    }

    /// Fetches a pending request after checking that it is intact and still
    /// applicable.
    ///
    /// # Errors
    ///
    /// - [`ApprovalError::NotFound`] if no request has this identifier.
    /// - [`ApprovalError::Conflict`] if the identifier is locked.
    /// - [`ApprovalError::InvalidType`] or [`ApprovalError::IntegrityFailure`]
    ///   if the stored record is unusable.
    /// - The request kind's own error if it no longer applies.
    pub fn get(&self, caller: &Caller, id: &str) -> Result<Box<dyn Request>> {
        let fingerprint = Fingerprint::parse(id).ok_or(ApprovalError::NotFound)?;
        let _guard = LockGuard::claim(self.locks.as_ref(), fingerprint.as_str())?;
        self.load(&self.context(), caller, &fingerprint)
    }

    /// Approves a pending request.
    ///
    /// Without a share this records `caller`'s approval. With a share, the
    /// share is collected toward reconstructing a root token; an empty share
    /// counts as none.
    ///
    /// # Errors
    ///
    /// Every error of [`get`](Self::get), plus the errors of recording the
    /// approval or applying the request.
    pub fn approve(
        &self,
        caller: &Caller,
        id: &str,
        share: Option<SecretString>,
    ) -> Result<ApprovalOutcome> {
        let fingerprint = Fingerprint::parse(id).ok_or(ApprovalError::NotFound)?;
        let _guard = LockGuard::claim(self.locks.as_ref(), fingerprint.as_str())?;
        let ctx = self.context();
        let request = self.load(&ctx, caller, &fingerprint)?;

        let share = share.filter(|share| !share.expose_secret().is_empty());
        request.approve(&ctx, caller, &fingerprint, share)
    }

    /// Rejects and removes a pending request.
    ///
    /// # Errors
    ///
    /// Every error of [`get`](Self::get), plus the request kind's refusal if
    /// `caller` may not reject it.
    pub fn reject(&self, caller: &Caller, id: &str) -> Result<()> {
        let fingerprint = Fingerprint::parse(id).ok_or(ApprovalError::NotFound)?;
        let _guard = LockGuard::claim(self.locks.as_ref(), fingerprint.as_str())?;
        let ctx = self.context();
        let request = self.load(&ctx, caller, &fingerprint)?;
        request.reject(&ctx, caller, &fingerprint)
    }

    /// Reads, decodes and checks the request stored under `fingerprint`.
    /// The caller must hold the fingerprint's lock.
    fn load(
        &self,
        ctx: &Context<'_>,
        caller: &Caller,
        fingerprint: &Fingerprint,
    ) -> Result<Box<dyn Request>> {
        let fields = self
            .backend
            .read(&self.config.request_path(fingerprint.as_str()))?
            .ok_or(ApprovalError::NotFound)?;
        let request = Self::check_integrity(ctx, fingerprint, fields)?;
        request.verify(ctx, caller)?;
        Ok(request)
    }

    /// Decodes a stored record and checks it against its identifier and its
    /// progress seal.
    fn check_integrity(
        ctx: &Context<'_>,
        fingerprint: &Fingerprint,
        mut fields: Fields,
    ) -> Result<Box<dyn Request>> {
        let seal = fields.remove(SEAL_FIELD);
        let kind_name = type_field(&fields)
            .ok_or_else(|| ApprovalError::InvalidType("missing Type field".to_string()))?;
        let kind: RequestKind = kind_name
            .parse()
            .map_err(|_| ApprovalError::InvalidType(kind_name.to_string()))?;
        let request = kind.decode(&fields)?;

        if !request.fingerprint()?.matches(fingerprint) {
            log::warn!("stored request {fingerprint} does not match its identifier");
            return Err(ApprovalError::integrity("hashes do not match"));
        }

        let sealed = match seal.as_ref().and_then(serde_json::Value::as_str) {
            Some(seal) => ctx.progress_key().verify(
                fingerprint,
                &request.to_fields()?,
                request.progress_fields(),
                seal,
            )?,
            None => false,
        };
        if !sealed {
            log::warn!("stored request {fingerprint} carries no valid progress seal");
            return Err(ApprovalError::integrity("progress seal does not match"));
        }
        Ok(request)
    }
}
