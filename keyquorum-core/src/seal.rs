//! Keyed seals over request approval progress.
//!
//! Fields such as `Approvers` change while a request is pending, so they are
//! left out of its [`Fingerprint`]. Anyone able to write the record could
//! otherwise stuff them. Every stored request therefore carries a seal: an
//! HMAC-SHA256, under a key only the service holds, binding the progress
//! fields to the request's fingerprint.
//!
//! ```text
//! seal = HMAC-SHA256(key, DOMAIN || fingerprint || Fingerprint::of(progress fields))
//! ```

use std::fmt;

use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::backend::Fields;
use crate::error::{ApprovalError, Result};
use crate::fingerprint::Fingerprint;

type HmacSha256 = Hmac<Sha256>;

const DOMAIN: &[u8] = b"keyquorum:progress-seal:v1";

/// Length of a [`ProgressKey`] in bytes.
pub const KEY_LEN: usize = 32;

/// Secret key the service seals approval progress with.
///
/// Pending requests are only usable by services holding the key they were
/// sealed with, so deployments keep it stable across restarts.
pub struct ProgressKey(Zeroizing<[u8; KEY_LEN]>);

impl fmt::Debug for ProgressKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProgressKey([REDACTED])")
    }
}

impl ProgressKey {
    /// Generates a random key from the OS RNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(key.as_mut_slice());
        Self(key)
    }

    /// Wraps existing key material.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Parses a hex-encoded key.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::ValidationFailed`] unless `encoded` is
    /// exactly [`KEY_LEN`] bytes of hex.
    pub fn from_hex(encoded: &str) -> Result<Self> {
        let bytes = Zeroizing::new(
            hex::decode(encoded.trim())
                .map_err(|e| ApprovalError::validation(format!("invalid progress key: {e}")))?,
        );
        let key: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
            ApprovalError::validation(format!(
                "progress key must be {KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self::from_bytes(key))
    }

    fn mac(
        &self,
        fingerprint: &Fingerprint,
        fields: &Fields,
        progress: &[&str],
    ) -> Result<HmacSha256> {
        let progress_only: Fields = fields
            .iter()
            .filter(|(key, _)| progress.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        let mut mac = HmacSha256::new_from_slice(self.0.as_slice())
            .map_err(|e| ApprovalError::integrity(format!("unusable progress key: {e}")))?;
        mac.update(DOMAIN);
        mac.update(fingerprint.as_str().as_bytes());
        mac.update(Fingerprint::of(&progress_only, &[]).as_str().as_bytes());
        Ok(mac)
    }

    /// Seals the `progress` fields of `fields` to `fingerprint`. Returns the
    /// hex-encoded tag.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::IntegrityFailure`] if the key is unusable.
    pub fn seal(
        &self,
        fingerprint: &Fingerprint,
        fields: &Fields,
        progress: &[&str],
    ) -> Result<String> {
        let mac = self.mac(fingerprint, fields, progress)?;
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Checks `tag` against the seal of `fields` in constant time.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::IntegrityFailure`] if the key is unusable.
    pub fn verify(
        &self,
        fingerprint: &Fingerprint,
        fields: &Fields,
        progress: &[&str],
        tag: &str,
    ) -> Result<bool> {
        let Ok(tag) = hex::decode(tag) else {
            return Ok(false);
        };
        let mac = self.mac(fingerprint, fields, progress)?;
        Ok(mac.verify_slice(&tag).is_ok())
    }
}
