//! Root token reconstruction.
//!
//! The backend never returns the root token in the clear. The attempt is
//! bound to a random one-time pad, and on completion the backend hands back
//! `base64(token XOR otp)`. Only this process knows the pad, so only it can
//! recover the token.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::{rngs::OsRng, RngCore};
use secrecy::SecretString;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::backend::RootGenerator;
use crate::error::{ApprovalError, Result};
use crate::locks::{LockGuard, LockRegistry, ROOT_GENERATION_KEY};

/// Length in bytes of the one-time pad, and of the raw root token.
pub const OTP_LEN: usize = 16;

/// Drives one root-generation attempt with `shares`, returning the root
/// token in canonical UUID form.
///
/// Holds [`ROOT_GENERATION_KEY`] for the whole attempt. Shares are supplied
/// in order and supplying stops as soon as the backend produces a token.
/// Any failed update aborts the attempt and asks the backend to cancel it.
///
/// # Errors
///
/// - [`ApprovalError::Conflict`] if another attempt holds the root lock.
/// - [`ApprovalError::InvalidShare`] if the backend refuses a share. A failed
///   cancellation is reported alongside the original reason.
/// - [`ApprovalError::QuorumNotReached`] if every share was accepted but no
///   token was produced.
/// - [`ApprovalError::Critical`] if the produced token cannot be decoded.
pub fn generate_root_token<G, L>(
    generator: &G,
    locks: &L,
    shares: &[SecretString],
) -> Result<SecretString>
where
    G: RootGenerator + ?Sized,
    L: LockRegistry + ?Sized,
{
    let _guard = LockGuard::claim(locks, ROOT_GENERATION_KEY)?;
    reconstruct_root_token(generator, shares)
}

/// Same as [`generate_root_token`] for callers that already hold
/// [`ROOT_GENERATION_KEY`].
///
/// # Errors
///
/// See [`generate_root_token`], except for the lock conflict.
pub fn reconstruct_root_token<G>(generator: &G, shares: &[SecretString]) -> Result<SecretString>
where
    G: RootGenerator + ?Sized,
{
    let mut otp = Zeroizing::new([0u8; OTP_LEN]);
    OsRng.fill_bytes(otp.as_mut_slice());
    let encoded_otp = Zeroizing::new(STANDARD.encode(otp.as_slice()));

    let status = generator.generate_root_init(&encoded_otp)?;
    let nonce = status.nonce;
    let mut encoded_token = status.encoded_root_token;

    for share in shares {
        if encoded_token.is_some() {
            break;
        }
        match generator.generate_root_update(share, &nonce) {
            Ok(status) => encoded_token = status.encoded_root_token,
            Err(err) => {
                log::warn!("root generation update refused a share: {err}");
                return Err(ApprovalError::InvalidShare {
                    reason: err.to_string(),
                    cancel_failure: cancel(generator).err(),
                });
            }
        }
    }

    let Some(encoded_token) = encoded_token else {
        log::warn!(
            "root generation incomplete after {} shares, cancelling",
            shares.len()
        );
        if let Err(err) = cancel(generator) {
            log::warn!("could not cancel root generation: {err}");
        }
        return Err(ApprovalError::QuorumNotReached);
    };

    decode_root_token(&encoded_token, otp.as_slice())
}

fn cancel<G: RootGenerator + ?Sized>(generator: &G) -> std::result::Result<(), String> {
    generator.generate_root_cancel().map_err(|err| err.to_string())
}

/// Recovers the root token from the backend's encoded form and the pad the
/// attempt was started with.
///
/// # Errors
///
/// Returns [`ApprovalError::Critical`] if the token cannot be recovered. A
/// valid root token may exist at that point and has to be found and revoked
/// by an operator.
pub fn decode_root_token(encoded_token: &str, otp: &[u8]) -> Result<SecretString> {
    let decoded = STANDARD
        .decode(encoded_token)
        .map(Zeroizing::new)
        .map_err(|err| critical(&format!("invalid base64: {err}")))?;
    if decoded.len() != otp.len() {
        return Err(critical(&format!(
            "length mismatch: token is {} bytes, pad is {}",
            decoded.len(),
            otp.len()
        )));
    }

    let raw: Zeroizing<Vec<u8>> =
        Zeroizing::new(decoded.iter().zip(otp).map(|(t, o)| t ^ o).collect());
    let token = Uuid::from_slice(&raw).map_err(|err| critical(&err.to_string()))?;
    Ok(SecretString::from(token.hyphenated().to_string()))
}

fn critical(detail: &str) -> ApprovalError {
    log::error!("could not decode root token, search for and revoke it: {detail}");
    ApprovalError::Critical(format!(
        "could not decode root token, search for and revoke it: {detail}"
    ))
}
