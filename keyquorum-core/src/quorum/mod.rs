//! Quorum share collection and root token reconstruction.
//!
//! Shares arrive one per call. Each is wrapped by the backend behind a
//! single-use, short-lived token as soon as it is received, and only the
//! wrapping token is persisted, in a per-request [`bundle`](append_share).
//! Once enough shares are collected the whole bundle is redeemed and fed to
//! the backend's root-generation protocol by [`generate_root_token`].

mod bundle;
mod root;

pub use bundle::{append_share, discard_bundle, unwrap_shares, UNSEAL_TOKEN_FIELD};
pub use root::{decode_root_token, generate_root_token, reconstruct_root_token, OTP_LEN};
