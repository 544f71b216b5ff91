//! Busy-set locking for request operations.
//!
//! Operations on the same request must not interleave, and the backend has no
//! transactions to fall back on. A [`LockRegistry`] holds the set of keys
//! currently being worked on. Claims never wait: a key that is already held
//! makes the second caller fail immediately with
//! [`ApprovalError::Conflict`](crate::ApprovalError::Conflict).
//!
//! Root generation mutates backend-wide state, so it is serialized
//! process-wide by claiming the distinguished [`ROOT_GENERATION_KEY`], which
//! can never collide with a request fingerprint.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use crate::error::{ApprovalError, Result};

/// Key claimed for the whole duration of a root-generation attempt.
pub const ROOT_GENERATION_KEY: &str = "sys/generate-root";

/// Set of keys currently held by in-flight operations.
///
/// Implementations must be safe to share between threads: for any one key,
/// exactly one of several concurrent `acquire` calls returns `true`.
pub trait LockRegistry: Send + Sync {
    /// Marks `key` as held. Returns `false`, changing nothing, if it already is.
    fn acquire(&self, key: &str) -> bool;

    /// Clears the held mark for `key`, whether or not it was set.
    fn release(&self, key: &str);
}

/// Process-local [`LockRegistry`] backed by a mutex-guarded set.
#[derive(Debug, Default)]
pub struct MemoryLockRegistry {
    busy: Mutex<HashSet<String>>,
}

impl MemoryLockRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if `key` is currently held.
    #[must_use]
    pub fn is_held(&self, key: &str) -> bool {
        self.busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }
}

impl LockRegistry for MemoryLockRegistry {
    fn acquire(&self, key: &str) -> bool {
        // A poisoned set is still a consistent set: inserts and removes are atomic.
        self.busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string())
    }

    fn release(&self, key: &str) {
        self.busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

/// Guard that holds a key in a [`LockRegistry`] for its lifetime.
#[derive(Debug)]
pub struct LockGuard<'a, R: LockRegistry + ?Sized> {
    registry: &'a R,
    key: String,
}

impl<'a, R: LockRegistry + ?Sized> LockGuard<'a, R> {
    /// Claims `key`, or returns `None` if another operation holds it.
    pub fn try_claim(registry: &'a R, key: &str) -> Option<Self> {
        registry.acquire(key).then(|| Self {
            registry,
            key: key.to_string(),
        })
    }

    /// Claims `key`.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::Conflict`] if another operation holds it.
    pub fn claim(registry: &'a R, key: &str) -> Result<Self> {
        Self::try_claim(registry, key).ok_or_else(|| {
            log::debug!("lock contention on {key}");
            ApprovalError::Conflict
        })
    }

    /// The claimed key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl<R: LockRegistry + ?Sized> Drop for LockGuard<'_, R> {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}
