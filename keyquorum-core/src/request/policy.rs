//! Policy change requests.
//!
//! A policy request proposes replacing (or, with an empty document, deleting)
//! a named access policy. It snapshots the policy as it was when proposed;
//! if the live policy drifts from that snapshot the request goes stale.
//!
//! # Approval paths
//!
//! ```text
//! approve(caller, share = None)
//!    ├─ RootOnly → ValidationFailed
//!    ├─ add caller to Approvers (idempotent), persist
//!    └─ |Approvers| ≥ RequiredApprovals → apply as service, delete request
//!
//! approve(caller, share = Some(s))
//!    ├─ wrap s, append to share bundle
//!    └─ bundle ≥ backend quorum
//!       ├─ unwrap every share (expired → ShareExpired, bundle dropped)
//!       ├─ reconstruct root token
//!       ├─ apply as root, revoke root token
//!       └─ delete request
//! ```

use std::any::Any;
use std::collections::BTreeSet;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use super::schema::{self, FieldSpec, FieldType};
use super::{ApprovalOutcome, Context, Request, RequestKind, TYPE_FIELD};
use crate::backend::{Authority, BackendError, Caller, Fields};
use crate::error::{ApprovalError, Result};
use crate::fingerprint::Fingerprint;
use crate::locks::{LockGuard, ROOT_GENERATION_KEY};
use crate::quorum;

const APPROVERS_FIELD: &str = "Approvers";

/// Fields a caller may submit when proposing a policy change.
const CREATE_SCHEMA: &[FieldSpec] = &[
    FieldSpec::required(TYPE_FIELD, FieldType::NonEmptyString),
    FieldSpec::required("PolicyName", FieldType::NonEmptyString),
    FieldSpec::required("Proposed", FieldType::String),
    FieldSpec::optional("RequiredApprovals", FieldType::PositiveInteger),
    FieldSpec::optional("RootOnly", FieldType::Bool),
];

/// Fields of a stored policy request.
const STORED_SCHEMA: &[FieldSpec] = &[
    FieldSpec::required(TYPE_FIELD, FieldType::NonEmptyString),
    FieldSpec::required("PolicyName", FieldType::NonEmptyString),
    FieldSpec::required("Proposed", FieldType::String),
    FieldSpec::required("Previous", FieldType::OptionalString),
    FieldSpec::required("Requester", FieldType::NonEmptyString),
    FieldSpec::required("RequiredApprovals", FieldType::PositiveInteger),
    FieldSpec::required("RootOnly", FieldType::Bool),
    FieldSpec::required(APPROVERS_FIELD, FieldType::StringList),
];

/// Input accepted by [`PolicyRequest::create`], after the schema check.
#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Proposal {
    policy_name: String,
    proposed: String,
    #[serde(default = "default_required_approvals")]
    required_approvals: usize,
    #[serde(default)]
    root_only: bool,
}

const fn default_required_approvals() -> usize {
    1
}

/// A proposed change to a named policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyRequest {
    #[serde(rename = "Type")]
    kind: String,
    policy_name: String,
    proposed: String,
    previous: Option<String>,
    requester: String,
    required_approvals: usize,
    root_only: bool,
    approvers: BTreeSet<String>,
}

impl PolicyRequest {
    /// Name of the targeted policy.
    #[must_use]
    pub fn policy_name(&self) -> &str {
        &self.policy_name
    }

    /// The proposed document. Empty means the policy will be deleted.
    #[must_use]
    pub fn proposed(&self) -> &str {
        &self.proposed
    }

    /// The document observed when the request was made, if the policy existed.
    #[must_use]
    pub fn previous(&self) -> Option<&str> {
        self.previous.as_deref()
    }

    /// Identifier of the proposing caller.
    #[must_use]
    pub fn requester(&self) -> &str {
        &self.requester
    }

    /// Distinct approvers needed.
    #[must_use]
    pub const fn required_approvals(&self) -> usize {
        self.required_approvals
    }

    /// Callers who have approved so far.
    #[must_use]
    pub const fn approvers(&self) -> &BTreeSet<String> {
        &self.approvers
    }

    /// Whether applying the request deletes the policy.
    #[must_use]
    pub fn is_deletion(&self) -> bool {
        self.proposed.is_empty()
    }

    fn apply(&self, ctx: &Context<'_>, authority: Authority<'_>) -> Result<()> {
        let backend = ctx.backend();
        if self.is_deletion() {
            backend.delete_policy(authority, &self.policy_name)?;
        } else {
            backend.write_policy(authority, &self.policy_name, &self.proposed)?;
        }
        Ok(())
    }

    /// Removes the request and any share bundle collected for it.
    fn discard(ctx: &Context<'_>, fingerprint: &Fingerprint) -> Result<()> {
        quorum::discard_bundle(ctx, fingerprint)?;
        ctx.backend()
            .delete(&ctx.config().request_path(fingerprint.as_str()))?;
        Ok(())
    }

    fn record_approval(
        &self,
        ctx: &Context<'_>,
        caller: &Caller,
        fingerprint: &Fingerprint,
    ) -> Result<ApprovalOutcome> {
        if self.root_only {
            return Err(ApprovalError::validation(format!(
                "request {fingerprint} can only be approved with unseal shares"
            )));
        }

        if caller.id() == self.requester {
            return Err(ApprovalError::validation(format!(
                "{} proposed request {fingerprint} and cannot approve it",
                caller.id()
            )));
        }

        let mut updated = self.clone();
        if !updated.approvers.insert(caller.id().to_string()) {
            log::debug!("{} already approved {fingerprint}", caller.id());
        }
        let approvals = updated.approvers.len();

        if approvals >= self.required_approvals {
            self.apply(ctx, Authority::Service)?;
            Self::discard(ctx, fingerprint)?;
            log::info!(
                "policy request {fingerprint} approved, policy {} {}",
                self.policy_name,
                if self.is_deletion() { "deleted" } else { "updated" }
            );
            return Ok(ApprovalOutcome::Approved);
        }

        ctx.store(fingerprint, &updated)?;
        log::info!(
            "{} approved policy request {fingerprint} ({approvals}/{})",
            caller.id(),
            self.required_approvals
        );
        Ok(ApprovalOutcome::Pending {
            approvals,
            required: self.required_approvals,
        })
    }

    fn collect_share(
        &self,
        ctx: &Context<'_>,
        fingerprint: &Fingerprint,
        share: SecretString,
    ) -> Result<ApprovalOutcome> {
        let backend = ctx.backend();
        let wrapping_tokens = quorum::append_share(ctx, fingerprint, &share)?;
        drop(share);

        let required = backend.generate_root_status()?.required;
        let collected = wrapping_tokens.len();
        if collected < required {
            log::info!("share {collected}/{required} collected for policy request {fingerprint}");
            return Ok(ApprovalOutcome::SharesPending {
                collected,
                required,
            });
        }

        // Claimed before the bundle is redeemed so contention keeps the shares.
        let _root_guard = LockGuard::claim(ctx.locks(), ROOT_GENERATION_KEY)?;
        let shares = quorum::unwrap_shares(ctx, fingerprint, &wrapping_tokens)?;
        quorum::discard_bundle(ctx, fingerprint)?;

        let root_token = quorum::reconstruct_root_token(backend, &shares)
            .inspect_err(|err| {
                if matches!(err, ApprovalError::Critical(_)) {
                    log::error!("root token for policy request {fingerprint} is unaccounted for");
                }
            })?;
        drop(shares);

        let applied = self.apply(ctx, Authority::Root(&root_token));
        if ctx.config().revoke_root_token {
            if let Err(err) = backend.revoke_token(&root_token) {
                log::error!(
                    "could not revoke root token generated for policy request {fingerprint}, \
                     search for and revoke it: {err}"
                );
            }
        }
        applied?;

        Self::discard(ctx, fingerprint)?;
        log::info!(
            "policy request {fingerprint} approved by quorum, policy {} {}",
            self.policy_name,
            if self.is_deletion() { "deleted" } else { "updated" }
        );
        Ok(ApprovalOutcome::Approved)
    }

    /// Reads the live policy with the caller's identity.
    fn current_policy(&self, ctx: &Context<'_>, caller: &Caller) -> Result<Option<String>> {
        Ok(ctx.backend().read_policy(caller, &self.policy_name)?)
    }
}

impl Request for PolicyRequest {
    fn create(ctx: &Context<'_>, caller: &Caller, raw: &Fields) -> Result<Self> {
        schema::check(raw, CREATE_SCHEMA).map_err(ApprovalError::ValidationFailed)?;
        let proposal: Proposal = serde_json::from_value(serde_json::Value::Object(raw.clone()))
            .map_err(|e| ApprovalError::validation(e.to_string()))?;

        let current = match ctx.backend().read_policy(caller, &proposal.policy_name) {
            Ok(current) => current,
            Err(BackendError::PermissionDenied(reason)) => {
                return Err(ApprovalError::validation(format!(
                    "{} may not propose changes to policy {}: {reason}",
                    caller.id(),
                    proposal.policy_name
                )));
            }
            Err(err) => return Err(err.into()),
        };

        match (&current, proposal.proposed.as_str()) {
            (None, "") => {
                return Err(ApprovalError::validation(format!(
                    "policy {} does not exist, nothing to delete",
                    proposal.policy_name
                )));
            }
            (Some(document), proposed) if document.as_str() == proposed => {
                return Err(ApprovalError::validation(format!(
                    "proposed document for policy {} is identical to the current one",
                    proposal.policy_name
                )));
            }
            _ => {}
        }

        Ok(Self {
            kind: RequestKind::Policy.to_string(),
            policy_name: proposal.policy_name,
            proposed: proposal.proposed,
            previous: current,
            requester: caller.id().to_string(),
            required_approvals: proposal.required_approvals,
            root_only: proposal.root_only,
            approvers: BTreeSet::new(),
        })
    }

    fn decode(fields: &Fields) -> Result<Self> {
        schema::check(fields, STORED_SCHEMA).map_err(ApprovalError::IntegrityFailure)?;
        serde_json::from_value(serde_json::Value::Object(fields.clone()))
            .map_err(|e| ApprovalError::integrity(format!("undecodable policy request: {e}")))
    }

    fn kind(&self) -> RequestKind {
        RequestKind::Policy
    }

    fn is_root_only(&self) -> bool {
        self.root_only
    }

    fn to_fields(&self) -> Result<Fields> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(fields)) => Ok(fields),
            Ok(other) => Err(ApprovalError::integrity(format!(
                "policy request serialized to a non-object: {other}"
            ))),
            Err(e) => Err(ApprovalError::integrity(e.to_string())),
        }
    }

    fn progress_fields(&self) -> &'static [&'static str] {
        &[APPROVERS_FIELD]
    }

    fn verify(&self, ctx: &Context<'_>, caller: &Caller) -> Result<()> {
        let current = self.current_policy(ctx, caller)?;
        match (&self.previous, &current) {
            (Some(_), None) => Err(ApprovalError::stale(format!(
                "policy {} no longer exists",
                self.policy_name
            ))),
            (None, Some(_)) => Err(ApprovalError::stale(format!(
                "policy {} was created since the request was made",
                self.policy_name
            ))),
            (Some(previous), Some(current)) if previous != current => Err(ApprovalError::stale(
                format!("policy {} has changed since the request was made", self.policy_name),
            )),
            _ => Ok(()),
        }
    }

    fn approve(
        &self,
        ctx: &Context<'_>,
        caller: &Caller,
        fingerprint: &Fingerprint,
        share: Option<SecretString>,
    ) -> Result<ApprovalOutcome> {
        match share {
            None => self.record_approval(ctx, caller, fingerprint),
            Some(share) => self.collect_share(ctx, fingerprint, share),
        }
    }

    fn reject(&self, ctx: &Context<'_>, caller: &Caller, fingerprint: &Fingerprint) -> Result<()> {
        // Rejecting requires the same visibility as proposing.
        self.current_policy(ctx, caller)?;
        Self::discard(ctx, fingerprint)?;
        log::info!(
            "{} rejected policy request {fingerprint} for policy {}",
            caller.id(),
            self.policy_name
        );
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
