#![allow(
    dead_code,
    missing_docs,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

//! Common test utilities shared across integration tests.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use keyquorum_core::backend::memory::MemoryBackend;
use keyquorum_core::backend::{
    Authority, BackendResult, Caller, Fields, PolicyAdmin, RootGenerationStatus, RootGenerator,
    SecretStore,
};
use keyquorum_core::locks::MemoryLockRegistry;
use keyquorum_core::seal::{ProgressKey, KEY_LEN};
use keyquorum_core::{ApprovalService, WorkflowConfig};
use secrecy::SecretString;
use serde_json::Value;

pub const POLICY: &str = "readonly";
pub const CURRENT_DOCUMENT: &str = r#"path "secret/*" { capabilities = ["read"] }"#;
pub const PROPOSED_DOCUMENT: &str = r#"path "secret/*" { capabilities = ["read", "list"] }"#;
pub const SHARES: [&str; 3] = ["unseal-key-1", "unseal-key-2", "unseal-key-3"];
pub const PROGRESS_KEY: [u8; KEY_LEN] = [0x5a; KEY_LEN];

/// The key every test service seals approval progress with.
pub fn progress_key() -> ProgressKey {
    ProgressKey::from_bytes(PROGRESS_KEY)
}

/// A service wired to in-memory collaborators.
pub struct Harness {
    pub service: ApprovalService,
    pub backend: Arc<MemoryBackend>,
    pub locks: Arc<MemoryLockRegistry>,
}

/// Builds a harness whose backend needs `required` of [`SHARES`], with
/// [`POLICY`] set to [`CURRENT_DOCUMENT`] and readable by alice, bob and carol.
pub fn setup(required: usize) -> Harness {
    setup_with(required, WorkflowConfig::default())
}

pub fn setup_with(required: usize, config: WorkflowConfig) -> Harness {
    let backend = Arc::new(MemoryBackend::new(SHARES, required));
    backend.set_policy(POLICY, CURRENT_DOCUMENT);
    for caller in ["alice", "bob", "carol"] {
        backend.grant(caller, POLICY);
    }
    let locks = Arc::new(MemoryLockRegistry::new());
    let service = ApprovalService::new(backend.clone(), locks.clone(), config, progress_key())
        .expect("valid configuration");
    Harness {
        service,
        backend,
        locks,
    }
}

pub fn caller(id: &str) -> Caller {
    Caller::new(id, format!("token-{id}"))
}

pub fn fields(value: Value) -> Fields {
    value.as_object().cloned().expect("json object")
}

/// Raw fields proposing [`PROPOSED_DOCUMENT`] for [`POLICY`].
pub fn policy_change(required_approvals: u64) -> Fields {
    fields(serde_json::json!({
        "Type": "policy",
        "PolicyName": POLICY,
        "Proposed": PROPOSED_DOCUMENT,
        "RequiredApprovals": required_approvals,
    }))
}

pub fn share(index: usize) -> Option<SecretString> {
    Some(SecretString::from(SHARES[index]))
}

/// Initializes a tracing subscriber so workflow logs show up in test output.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("keyquorum_core=debug")
        .with_test_writer()
        .try_init();
}

/// Delegating backend that can park the next policy read until released.
///
/// Lets a test hold a request's lock from one thread (parked inside the
/// load preamble) while another thread operates on the same request.
pub struct GatedBackend {
    inner: Arc<MemoryBackend>,
    gate: Mutex<Option<(Sender<()>, Receiver<()>)>>,
}

/// Handle for the test side of a [`GatedBackend`] gate.
pub struct Gate {
    entered: Receiver<()>,
    release: Sender<()>,
}

impl Gate {
    /// Blocks until a caller is parked in the gate.
    pub fn wait_entered(&self) {
        self.entered
            .recv_timeout(Duration::from_secs(10))
            .expect("a caller entered the gate");
    }

    /// Lets the parked caller continue.
    pub fn open(self) {
        self.release.send(()).expect("parked caller is waiting");
    }
}

impl GatedBackend {
    pub fn new(inner: Arc<MemoryBackend>) -> Self {
        Self {
            inner,
            gate: Mutex::new(None),
        }
    }

    /// Arms the gate for the next policy read.
    pub fn arm(&self) -> Gate {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        *self.gate.lock().expect("gate") = Some((entered_tx, release_rx));
        Gate {
            entered: entered_rx,
            release: release_tx,
        }
    }
}

impl SecretStore for GatedBackend {
    fn read(&self, path: &str) -> BackendResult<Option<Fields>> {
        self.inner.read(path)
    }

    fn write(&self, path: &str, fields: Fields) -> BackendResult<()> {
        self.inner.write(path, fields)
    }

    fn delete(&self, path: &str) -> BackendResult<()> {
        self.inner.delete(path)
    }

    fn wrap(&self, ttl: Duration, payload: Fields) -> BackendResult<String> {
        self.inner.wrap(ttl, payload)
    }

    fn unwrap(&self, token: &str) -> BackendResult<Fields> {
        self.inner.unwrap(token)
    }
}

impl RootGenerator for GatedBackend {
    fn generate_root_status(&self) -> BackendResult<RootGenerationStatus> {
        self.inner.generate_root_status()
    }

    fn generate_root_init(&self, otp: &str) -> BackendResult<RootGenerationStatus> {
        self.inner.generate_root_init(otp)
    }

    fn generate_root_update(
        &self,
        share: &SecretString,
        nonce: &str,
    ) -> BackendResult<RootGenerationStatus> {
        self.inner.generate_root_update(share, nonce)
    }

    fn generate_root_cancel(&self) -> BackendResult<()> {
        self.inner.generate_root_cancel()
    }
}

impl PolicyAdmin for GatedBackend {
    fn read_policy(&self, caller: &Caller, name: &str) -> BackendResult<Option<String>> {
        let gate = self.gate.lock().expect("gate").take();
        if let Some((entered, release)) = gate {
            entered.send(()).expect("test is waiting");
            release
                .recv_timeout(Duration::from_secs(10))
                .expect("test released the gate");
        }
        self.inner.read_policy(caller, name)
    }

    fn write_policy(
        &self,
        authority: Authority<'_>,
        name: &str,
        document: &str,
    ) -> BackendResult<()> {
        self.inner.write_policy(authority, name, document)
    }

    fn delete_policy(&self, authority: Authority<'_>, name: &str) -> BackendResult<()> {
        self.inner.delete_policy(authority, name)
    }

    fn revoke_token(&self, token: &SecretString) -> BackendResult<()> {
        self.inner.revoke_token(token)
    }
}
