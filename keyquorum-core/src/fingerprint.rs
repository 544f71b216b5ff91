//! Structural request fingerprints.
//!
//! A fingerprint is the SHA-256 digest of a canonical encoding of a request's
//! fields. It is the request's public identifier and its storage key, and it
//! is recomputed on every load to detect tampering.
//!
//! # Encoding
//!
//! ```text
//! digest = SHA256("keyquorum:request-fingerprint:v1" || enc(fields))
//!
//! enc(null)    = 'z'
//! enc(bool)    = 'b' || 0x00 | 0x01
//! enc(number)  = 'n' || len_u64_be || decimal text
//! enc(string)  = 's' || len_u64_be || utf8
//! enc(array)   = 'a' || count_u64_be || enc(item)...
//! enc(object)  = 'o' || count_u64_be || (enc(key) || enc(value))...   keys sorted
//! ```
//!
//! Sorting object keys makes the digest independent of field order, and the
//! type tags keep `"1"` and `1` apart.

use std::fmt;

use serde_json::Value;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::backend::Fields;

const DOMAIN: &[u8] = b"keyquorum:request-fingerprint:v1";
const HEX_LEN: usize = 64;

/// Hex-encoded structural hash identifying a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Computes the fingerprint of `fields`, skipping the keys in `excluded`.
    #[must_use]
    pub fn of(fields: &Fields, excluded: &[&str]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(DOMAIN);
        encode_object(
            &mut hasher,
            fields
                .iter()
                .filter(|(key, _)| !excluded.contains(&key.as_str())),
        );
        Self(hex::encode(hasher.finalize()))
    }

    /// Parses an externally supplied identifier.
    ///
    /// Returns `None` unless `raw` is exactly 64 lowercase hex characters.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let well_formed = raw.len() == HEX_LEN
            && raw
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        well_formed.then(|| Self(raw.to_string()))
    }

    /// Compares two fingerprints in constant time.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        self.0.as_bytes().ct_eq(other.0.as_bytes()).into()
    }

    /// The hex form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn encode_len(hasher: &mut Sha256, len: usize) {
    hasher.update((len as u64).to_be_bytes());
}

fn encode_str(hasher: &mut Sha256, tag: u8, text: &str) {
    hasher.update([tag]);
    encode_len(hasher, text.len());
    hasher.update(text.as_bytes());
}

fn encode_object<'a>(hasher: &mut Sha256, entries: impl Iterator<Item = (&'a String, &'a Value)>) {
    let mut entries: Vec<_> = entries.collect();
    entries.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));
    hasher.update([b'o']);
    encode_len(hasher, entries.len());
    for (key, value) in entries {
        encode_str(hasher, b's', key);
        encode_value(hasher, value);
    }
}

fn encode_value(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update([b'z']),
        Value::Bool(flag) => hasher.update([b'b', u8::from(*flag)]),
        Value::Number(number) => encode_str(hasher, b'n', &number.to_string()),
        Value::String(text) => encode_str(hasher, b's', text),
        Value::Array(items) => {
            hasher.update([b'a']);
            encode_len(hasher, items.len());
            for item in items {
                encode_value(hasher, item);
            }
        }
        Value::Object(map) => encode_object(hasher, map.iter()),
    }
}
