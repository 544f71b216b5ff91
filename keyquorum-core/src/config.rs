//! Workflow configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ApprovalError, Result};

/// Default storage prefix for pending requests.
pub const DEFAULT_REQUEST_PREFIX: &str = "requests/";
/// Default storage prefix for wrapped share bundles.
pub const DEFAULT_SHARE_BUNDLE_PREFIX: &str = "unseal_wrapping_tokens/";
/// Default lifetime of a wrapped share: one hour.
pub const DEFAULT_SHARE_WRAP_TTL_SECS: u64 = 60 * 60;

/// Settings for an [`ApprovalService`](crate::ApprovalService).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkflowConfig {
    /// Prefix under which requests are stored, keyed by fingerprint.
    pub request_prefix: String,
    /// Prefix under which share bundles are stored, keyed by fingerprint.
    pub share_bundle_prefix: String,
    /// How long a submitted share stays redeemable, in seconds.
    pub share_wrap_ttl_secs: u64,
    /// Revoke a reconstructed root token once the approved change is applied.
    pub revoke_root_token: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            request_prefix: DEFAULT_REQUEST_PREFIX.to_string(),
            share_bundle_prefix: DEFAULT_SHARE_BUNDLE_PREFIX.to_string(),
            share_wrap_ttl_secs: DEFAULT_SHARE_WRAP_TTL_SECS,
            revoke_root_token: true,
        }
    }
}

impl WorkflowConfig {
    /// Deserializes and validates a configuration from JSON. Missing keys
    /// take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or the configuration fails
    /// [`validate`](Self::validate).
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ApprovalError::validation(format!("invalid workflow config json: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that prefixes are non-empty, end in `/` and differ, and that
    /// the wrap TTL is positive.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::ValidationFailed`] describing the first problem.
    pub fn validate(&self) -> Result<()> {
        for (name, prefix) in [
            ("request_prefix", &self.request_prefix),
            ("share_bundle_prefix", &self.share_bundle_prefix),
        ] {
            if prefix.len() < 2 || !prefix.ends_with('/') {
                return Err(ApprovalError::validation(format!(
                    "{name} must be a non-empty path ending in '/', got {prefix:?}"
                )));
            }
        }
        if self.request_prefix == self.share_bundle_prefix {
            return Err(ApprovalError::validation(
                "request_prefix and share_bundle_prefix must differ",
            ));
        }
        if self.share_wrap_ttl_secs == 0 {
            return Err(ApprovalError::validation("share_wrap_ttl_secs must be positive"));
        }
        Ok(())
    }

    /// Lifetime of a wrapped share.
    #[must_use]
    pub const fn share_wrap_ttl(&self) -> Duration {
        Duration::from_secs(self.share_wrap_ttl_secs)
    }

    pub(crate) fn request_path(&self, fingerprint: &str) -> String {
        format!("{}{fingerprint}", self.request_prefix)
    }

    pub(crate) fn share_bundle_path(&self, fingerprint: &str) -> String {
        format!("{}{fingerprint}", self.share_bundle_prefix)
    }
}
