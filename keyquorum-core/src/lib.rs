#![deny(clippy::all, clippy::pedantic, clippy::nursery)]
//! Multi-party approval of privileged changes against a secret backend.
//!
//! Callers propose a change with [`ApprovalService::add`] and receive its
//! [`Fingerprint`], a structural hash of the request that doubles as its
//! identifier and integrity check. Other callers then
//! [`approve`](ApprovalService::approve) or [`reject`](ApprovalService::reject)
//! it. Once enough approvals are recorded the change is applied and the
//! request removed.
//!
//! Requests can also be approved with quorum shares. Shares arrive one per
//! call and are wrapped by the backend on receipt; once the backend's quorum
//! is reached they are redeemed and used to reconstruct a short-lived root
//! token, which applies the change and is then revoked.
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use keyquorum_core::backend::{memory::MemoryBackend, Caller};
//! use keyquorum_core::locks::MemoryLockRegistry;
//! use keyquorum_core::seal::ProgressKey;
//! use keyquorum_core::{ApprovalOutcome, ApprovalService, WorkflowConfig};
//!
//! let backend = Arc::new(MemoryBackend::default());
//! backend.set_policy("readonly", "path \"secret/*\" { capabilities = [\"read\"] }");
//! backend.grant("alice", "*");
//! backend.grant("bob", "*");
//!
//! let service = ApprovalService::new(
//!     backend.clone(),
//!     Arc::new(MemoryLockRegistry::new()),
//!     WorkflowConfig::default(),
//!     ProgressKey::generate(),
//! )?;
//!
//! let alice = Caller::new("alice", "alice-token");
//! let raw = serde_json::json!({
//!     "Type": "policy",
//!     "PolicyName": "readonly",
//!     "Proposed": "path \"secret/*\" { capabilities = [\"list\"] }",
//!     "RequiredApprovals": 1,
//! });
//! let id = service.add(&alice, raw.as_object().expect("object"))?;
//!
//! let bob = Caller::new("bob", "bob-token");
//! assert_eq!(service.approve(&bob, id.as_str(), None)?, ApprovalOutcome::Approved);
//! # Ok::<(), keyquorum_core::ApprovalError>(())
//! ```

pub mod backend;
pub mod config;
pub mod fingerprint;
pub mod locks;
pub mod logger;
pub mod quorum;
pub mod request;
pub mod seal;

mod error;
pub use error::*;

mod service;
pub use service::ApprovalService;

pub use config::WorkflowConfig;
pub use fingerprint::Fingerprint;
pub use request::{ApprovalOutcome, PolicyRequest, Request, RequestKind};
