//! In-memory implementation of the backend traits for testing.
//!
//! This implementation is NOT secure for production use. It simulates the
//! parts of a secret-management server the workflow depends on: a private
//! key/value namespace, single-use response wrapping with expiry, a quorum
//! root-generation protocol, and per-caller policy grants.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, SecretString};
use uuid::Uuid;

use super::{
    Authority, BackendError, BackendResult, Caller, Fields, PolicyAdmin, RootGenerationStatus,
    RootGenerator, SecretStore,
};

const WILDCARD: &str = "*";

struct WrappedPayload {
    payload: Fields,
    expires_at: Instant,
}

struct RootAttempt {
    nonce: String,
    otp: Vec<u8>,
    accepted: Vec<String>,
}

struct RootState {
    shares: HashSet<String>,
    required: usize,
    token: [u8; 16],
    attempt: Option<RootAttempt>,
}

/// In-memory secret backend.
///
/// **FOR TESTING ONLY.** Thread-safe so concurrent workflow calls can be
/// exercised against it.
pub struct MemoryBackend {
    records: RwLock<HashMap<String, Fields>>,
    wrapped: Mutex<HashMap<String, WrappedPayload>>,
    root: Mutex<RootState>,
    policies: RwLock<HashMap<String, String>>,
    grants: RwLock<HashMap<String, HashSet<String>>>,
    revoked: Mutex<HashSet<String>>,
    cancels: AtomicUsize,
    fail_cancel: AtomicBool,
}

impl MemoryBackend {
    /// Creates a backend whose root generation accepts any `required` of the
    /// given `shares`.
    #[must_use]
    pub fn new<I, S>(shares: I, required: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut token = [0u8; 16];
        OsRng.fill_bytes(&mut token);
        Self {
            records: RwLock::new(HashMap::new()),
            wrapped: Mutex::new(HashMap::new()),
            root: Mutex::new(RootState {
                shares: shares.into_iter().map(Into::into).collect(),
                required,
                token,
                attempt: None,
            }),
            policies: RwLock::new(HashMap::new()),
            grants: RwLock::new(HashMap::new()),
            revoked: Mutex::new(HashSet::new()),
            cancels: AtomicUsize::new(0),
            fail_cancel: AtomicBool::new(false),
        }
    }

    /// The root token that a completed generation yields, in canonical form.
    #[must_use]
    pub fn root_token(&self) -> String {
        Uuid::from_bytes(lock(&self.root).token).hyphenated().to_string()
    }

    /// Sets a policy document directly, bypassing authorization.
    pub fn set_policy(&self, name: &str, document: &str) {
        write(&self.policies).insert(name.to_string(), document.to_string());
    }

    /// Returns the current policy document, bypassing authorization.
    #[must_use]
    pub fn policy(&self, name: &str) -> Option<String> {
        read(&self.policies).get(name).cloned()
    }

    /// Allows `caller_id` to view the policy `name`. `"*"` grants every policy.
    pub fn grant(&self, caller_id: &str, name: &str) {
        write(&self.grants)
            .entry(caller_id.to_string())
            .or_default()
            .insert(name.to_string());
    }

    /// Removes every grant held by `caller_id`.
    pub fn revoke_grants(&self, caller_id: &str) {
        write(&self.grants).remove(caller_id);
    }

    /// Overwrites one field of a stored record, simulating out-of-band tampering.
    pub fn tamper(&self, path: &str, key: &str, value: serde_json::Value) {
        if let Some(record) = write(&self.records).get_mut(path) {
            record.insert(key.to_string(), value);
        }
    }

    /// Returns the stored record at `path` without going through the trait.
    #[must_use]
    pub fn record(&self, path: &str) -> Option<Fields> {
        read(&self.records).get(path).cloned()
    }

    /// Returns the number of stored records whose path starts with `prefix`.
    #[must_use]
    pub fn count_records(&self, prefix: &str) -> usize {
        read(&self.records)
            .keys()
            .filter(|path| path.starts_with(prefix))
            .count()
    }

    /// Returns the number of wrapping tokens not yet redeemed.
    #[must_use]
    pub fn outstanding_wrapping_tokens(&self) -> usize {
        lock(&self.wrapped).len()
    }

    /// Expires every outstanding wrapping token.
    pub fn expire_wrapping_tokens(&self) {
        let now = Instant::now();
        for wrapped in lock(&self.wrapped).values_mut() {
            wrapped.expires_at = now;
        }
    }

    /// Returns how many times `generate_root_cancel` was called.
    #[must_use]
    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    /// Makes subsequent cancellations fail.
    pub fn fail_cancellations(&self, fail: bool) {
        self.fail_cancel.store(fail, Ordering::SeqCst);
    }

    /// Returns `true` if the given token was revoked.
    #[must_use]
    pub fn is_revoked(&self, token: &str) -> bool {
        lock(&self.revoked).contains(token)
    }

    fn can_view(&self, caller: &Caller, name: &str) -> BackendResult<bool> {
        let grants = self
            .grants
            .read()
            .map_err(|_| BackendError::Unavailable("grants lock poisoned".to_string()))?;
        Ok(grants
            .get(caller.id())
            .is_some_and(|names| names.contains(name) || names.contains(WILDCARD)))
    }

    fn check_authority(&self, authority: Authority<'_>) -> BackendResult<()> {
        match authority {
            Authority::Service => Ok(()),
            Authority::Root(token) => {
                let token = token.expose_secret();
                if token != self.root_token() {
                    return Err(BackendError::PermissionDenied("unknown token".to_string()));
                }
                if lock(&self.revoked).contains(token) {
                    return Err(BackendError::PermissionDenied("token revoked".to_string()));
                }
                Ok(())
            }
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(Vec::<String>::new(), 1)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(rwlock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    rwlock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(rwlock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    rwlock.write().unwrap_or_else(PoisonError::into_inner)
}

fn status_of(state: &RootState) -> RootGenerationStatus {
    state.attempt.as_ref().map_or_else(
        || RootGenerationStatus {
            required: state.required,
            ..RootGenerationStatus::default()
        },
        |attempt| RootGenerationStatus {
            started: true,
            nonce: attempt.nonce.clone(),
            progress: attempt.accepted.len(),
            required: state.required,
            encoded_root_token: None,
        },
    )
}

impl SecretStore for MemoryBackend {
    fn read(&self, path: &str) -> BackendResult<Option<Fields>> {
        let records = self
            .records
            .read()
            .map_err(|_| BackendError::Unavailable("records lock poisoned".to_string()))?;
        Ok(records.get(path).cloned())
    }

    fn write(&self, path: &str, fields: Fields) -> BackendResult<()> {
        self.records
            .write()
            .map_err(|_| BackendError::Unavailable("records lock poisoned".to_string()))?
            .insert(path.to_string(), fields);
        Ok(())
    }

    fn delete(&self, path: &str) -> BackendResult<()> {
        self.records
            .write()
            .map_err(|_| BackendError::Unavailable("records lock poisoned".to_string()))?
            .remove(path);
        Ok(())
    }

    fn wrap(&self, ttl: Duration, payload: Fields) -> BackendResult<String> {
        let token = Uuid::new_v4().to_string();
        lock(&self.wrapped).insert(
            token.clone(),
            WrappedPayload {
                payload,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(token)
    }

    fn unwrap(&self, token: &str) -> BackendResult<Fields> {
        let wrapped = lock(&self.wrapped)
            .remove(token)
            .ok_or(BackendError::TokenExpired)?;
        if Instant::now() >= wrapped.expires_at {
            return Err(BackendError::TokenExpired);
        }
        Ok(wrapped.payload)
    }
}

impl RootGenerator for MemoryBackend {
    fn generate_root_status(&self) -> BackendResult<RootGenerationStatus> {
        Ok(status_of(&lock(&self.root)))
    }

    fn generate_root_init(&self, otp: &str) -> BackendResult<RootGenerationStatus> {
        let mut state = lock(&self.root);
        if state.attempt.is_some() {
            return Err(BackendError::RootGenerationInProgress);
        }
        let otp = STANDARD
            .decode(otp)
            .map_err(|err| BackendError::Serialization(format!("otp: {err}")))?;
        if otp.len() != state.token.len() {
            return Err(BackendError::Serialization(format!(
                "otp length mismatch: expected {}, got {}",
                state.token.len(),
                otp.len()
            )));
        }
        state.attempt = Some(RootAttempt {
            nonce: Uuid::new_v4().to_string(),
            otp,
            accepted: Vec::new(),
        });
        Ok(status_of(&state))
    }

    fn generate_root_update(
        &self,
        share: &SecretString,
        nonce: &str,
    ) -> BackendResult<RootGenerationStatus> {
        let mut guard = lock(&self.root);
        let state = &mut *guard;
        let attempt = state.attempt.as_mut().ok_or(BackendError::NoRootGeneration)?;
        if attempt.nonce != nonce {
            return Err(BackendError::InvalidShare("nonce mismatch".to_string()));
        }
        let share = share.expose_secret();
        if !state.shares.contains(share) {
            return Err(BackendError::InvalidShare("share is not a valid key".to_string()));
        }
        if attempt.accepted.iter().any(|accepted| accepted == share) {
            return Err(BackendError::InvalidShare("share already provided".to_string()));
        }
        attempt.accepted.push(share.to_string());

        if attempt.accepted.len() < state.required {
            return Ok(status_of(state));
        }

        let encoded: Vec<u8> = state
            .token
            .iter()
            .zip(attempt.otp.iter())
            .map(|(t, o)| t ^ o)
            .collect();
        let status = RootGenerationStatus {
            started: false,
            nonce: attempt.nonce.clone(),
            progress: attempt.accepted.len(),
            required: state.required,
            encoded_root_token: Some(STANDARD.encode(encoded)),
        };
        state.attempt = None;
        Ok(status)
    }

    fn generate_root_cancel(&self) -> BackendResult<()> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        if self.fail_cancel.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("cancel refused".to_string()));
        }
        lock(&self.root).attempt = None;
        Ok(())
    }
}

impl PolicyAdmin for MemoryBackend {
    fn read_policy(&self, caller: &Caller, name: &str) -> BackendResult<Option<String>> {
        if !self.can_view(caller, name)? {
            return Err(BackendError::PermissionDenied(format!(
                "{} may not read policy {name}",
                caller.id()
            )));
        }
        let policies = self
            .policies
            .read()
            .map_err(|_| BackendError::Unavailable("policies lock poisoned".to_string()))?;
        Ok(policies.get(name).cloned())
    }

    fn write_policy(
        &self,
        authority: Authority<'_>,
        name: &str,
        document: &str,
    ) -> BackendResult<()> {
        self.check_authority(authority)?;
        self.policies
            .write()
            .map_err(|_| BackendError::Unavailable("policies lock poisoned".to_string()))?
            .insert(name.to_string(), document.to_string());
        Ok(())
    }

    fn delete_policy(&self, authority: Authority<'_>, name: &str) -> BackendResult<()> {
        self.check_authority(authority)?;
        self.policies
            .write()
            .map_err(|_| BackendError::Unavailable("policies lock poisoned".to_string()))?
            .remove(name);
        Ok(())
    }

    fn revoke_token(&self, token: &SecretString) -> BackendResult<()> {
        lock(&self.revoked).insert(token.expose_secret().to_string());
        Ok(())
    }
}
