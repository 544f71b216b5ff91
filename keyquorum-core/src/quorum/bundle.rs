//! Persistence of wrapped share bundles.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::backend::{BackendError, Fields};
use crate::error::{ApprovalError, Result};
use crate::fingerprint::Fingerprint;
use crate::request::Context;

const BUNDLE_VERSION: u32 = 1;
const BUNDLE_FIELD: &str = "Bundle";

/// Key of the share inside a wrapped payload.
pub const UNSEAL_TOKEN_FIELD: &str = "unseal_token";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ShareBundle {
    version: u32,
    wrapping_tokens: Vec<String>,
}

impl ShareBundle {
    fn new() -> Self {
        Self {
            version: BUNDLE_VERSION,
            wrapping_tokens: Vec::new(),
        }
    }

    fn to_fields(&self) -> Result<Fields> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(self, &mut bytes)
            .map_err(|err| BackendError::Serialization(err.to_string()))?;
        let mut fields = Fields::new();
        fields.insert(BUNDLE_FIELD.to_string(), STANDARD.encode(bytes).into());
        Ok(fields)
    }

    fn from_fields(fields: &Fields) -> Result<Self> {
        let encoded = fields
            .get(BUNDLE_FIELD)
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| ApprovalError::integrity("share bundle has no payload"))?;
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|err| ApprovalError::integrity(format!("share bundle: {err}")))?;
        let bundle: Self = ciborium::de::from_reader(bytes.as_slice())
            .map_err(|err| ApprovalError::integrity(format!("share bundle: {err}")))?;
        if bundle.version != BUNDLE_VERSION {
            return Err(ApprovalError::integrity(format!(
                "unsupported share bundle version {}",
                bundle.version
            )));
        }
        Ok(bundle)
    }
}

fn load(ctx: &Context<'_>, path: &str) -> Result<ShareBundle> {
    ctx.backend()
        .read(path)?
        .map_or_else(|| Ok(ShareBundle::new()), |fields| ShareBundle::from_fields(&fields))
}

/// Wraps `share` and appends its wrapping token to the bundle of the request
/// identified by `fingerprint`.
///
/// Returns every wrapping token collected so far, oldest first.
///
/// # Errors
///
/// Returns an error if the stored bundle is corrupt or the backend refuses
/// to wrap or persist.
pub fn append_share(
    ctx: &Context<'_>,
    fingerprint: &Fingerprint,
    share: &SecretString,
) -> Result<Vec<String>> {
    let path = ctx.config().share_bundle_path(fingerprint.as_str());
    let mut bundle = load(ctx, &path)?;

    let mut payload = Fields::new();
    payload.insert(
        UNSEAL_TOKEN_FIELD.to_string(),
        share.expose_secret().to_string().into(),
    );
    let wrapping_token = ctx
        .backend()
        .wrap(ctx.config().share_wrap_ttl(), payload)?;

    bundle.wrapping_tokens.push(wrapping_token);
    ctx.backend().write(&path, bundle.to_fields()?)?;
    Ok(bundle.wrapping_tokens)
}

/// Redeems every wrapping token, returning the shares in submission order.
///
/// Each token can be redeemed once. If any of them expired or was already
/// used, the bundle is discarded and collection must start over.
///
/// # Errors
///
/// Returns [`ApprovalError::ShareExpired`] if a token cannot be redeemed or
/// its payload holds no share.
pub fn unwrap_shares(
    ctx: &Context<'_>,
    fingerprint: &Fingerprint,
    wrapping_tokens: &[String],
) -> Result<Vec<SecretString>> {
    let mut shares = Vec::with_capacity(wrapping_tokens.len());
    for (index, token) in wrapping_tokens.iter().enumerate() {
        let payload = match ctx.backend().unwrap(token) {
            Ok(payload) => payload,
            Err(BackendError::TokenExpired) => {
                log::warn!("wrapped share {index} for {fingerprint} expired, progress reset");
                return Err(reset_progress(ctx, fingerprint, index, wrapping_tokens.len()));
            }
            Err(err) => return Err(err.into()),
        };
        let Some(share) = payload
            .get(UNSEAL_TOKEN_FIELD)
            .and_then(serde_json::Value::as_str)
        else {
            log::warn!("wrapped share {index} for {fingerprint} holds no share, progress reset");
            return Err(reset_progress(ctx, fingerprint, index, wrapping_tokens.len()));
        };
        shares.push(SecretString::from(share.to_string()));
    }
    Ok(shares)
}

/// Drops a bundle whose tokens can no longer all be redeemed.
fn reset_progress(
    ctx: &Context<'_>,
    fingerprint: &Fingerprint,
    index: usize,
    total: usize,
) -> ApprovalError {
    if let Err(err) = discard_bundle(ctx, fingerprint) {
        log::warn!("could not discard share bundle for {fingerprint}: {err}");
    }
    ApprovalError::ShareExpired(format!(
        "share {} of {total} for request {fingerprint}",
        index + 1
    ))
}

/// Deletes the share bundle of the request identified by `fingerprint`.
///
/// # Errors
///
/// Returns an error if the backend delete fails.
pub fn discard_bundle(ctx: &Context<'_>, fingerprint: &Fingerprint) -> Result<()> {
    ctx.backend()
        .delete(&ctx.config().share_bundle_path(fingerprint.as_str()))?;
    Ok(())
}
