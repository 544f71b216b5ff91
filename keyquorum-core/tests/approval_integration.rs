//! End-to-end approval workflow tests against the in-memory backend.

mod common;

use std::sync::Arc;
use std::thread;

use common::{
    caller, fields, init_test_logging, policy_change, progress_key, setup, GatedBackend,
    CURRENT_DOCUMENT, POLICY, PROPOSED_DOCUMENT,
};
use keyquorum_core::backend::BackendError;
use keyquorum_core::locks::{LockRegistry, MemoryLockRegistry};
use keyquorum_core::seal::{ProgressKey, KEY_LEN};
use keyquorum_core::{
    ApprovalError, ApprovalOutcome, ApprovalService, PolicyRequest, WorkflowConfig,
};
use secrecy::SecretString;
use serde_json::{json, Value};
use test_case::test_case;

fn request_path(id: &str) -> String {
    format!("requests/{id}")
}

#[test]
fn test_add_then_get_returns_the_proposal() {
    init_test_logging();
    let harness = setup(3);
    let carol = caller("carol");

    let id = harness
        .service
        .add(&carol, &policy_change(2))
        .expect("add");
    assert_eq!(id.as_str().len(), 64);
    assert!(harness.backend.record(&request_path(id.as_str())).is_some());
    assert!(!harness.locks.is_held(id.as_str()));

    let request = harness.service.get(&caller("alice"), id.as_str()).expect("get");
    let policy = request
        .as_any()
        .downcast_ref::<PolicyRequest>()
        .expect("policy request");
    assert_eq!(policy.policy_name(), POLICY);
    assert_eq!(policy.proposed(), PROPOSED_DOCUMENT);
    assert_eq!(policy.previous(), Some(CURRENT_DOCUMENT));
    assert_eq!(policy.requester(), "carol");
    assert_eq!(policy.required_approvals(), 2);
    assert!(policy.approvers().is_empty());
    assert!(!keyquorum_core::request::is_root_only(request.as_ref()));
}

#[test]
fn test_identical_proposals_share_an_identifier() {
    let harness = setup(3);
    let first = harness
        .service
        .add(&caller("carol"), &policy_change(2))
        .expect("add");
    let alice = caller("alice");
    harness
        .service
        .approve(&alice, first.as_str(), None)
        .expect("approve");

    // A second caller proposing the same change finds the pending request,
    // approvals included.
    let second = harness
        .service
        .add(&caller("carol"), &policy_change(2))
        .expect("add again");
    assert_eq!(first, second);
    assert_eq!(harness.backend.count_records("requests/"), 1);

    let request = harness.service.get(&alice, first.as_str()).expect("get");
    let policy = request
        .as_any()
        .downcast_ref::<PolicyRequest>()
        .expect("policy request");
    assert_eq!(policy.approvers().len(), 1);
}

#[test]
fn test_two_approvers_apply_the_change() {
    init_test_logging();
    let harness = setup(3);
    let id = harness
        .service
        .add(&caller("carol"), &policy_change(2))
        .expect("add");

    let alice = caller("alice");
    assert_eq!(
        harness.service.approve(&alice, id.as_str(), None).expect("alice"),
        ApprovalOutcome::Pending {
            approvals: 1,
            required: 2
        }
    );
    // Approving twice does not count twice.
    assert_eq!(
        harness.service.approve(&alice, id.as_str(), None).expect("alice again"),
        ApprovalOutcome::Pending {
            approvals: 1,
            required: 2
        }
    );
    assert_eq!(harness.backend.policy(POLICY).as_deref(), Some(CURRENT_DOCUMENT));

    assert_eq!(
        harness
            .service
            .approve(&caller("bob"), id.as_str(), None)
            .expect("bob"),
        ApprovalOutcome::Approved
    );
    assert_eq!(harness.backend.policy(POLICY).as_deref(), Some(PROPOSED_DOCUMENT));
    assert!(matches!(
        harness.service.get(&alice, id.as_str()),
        Err(ApprovalError::NotFound)
    ));
    assert_eq!(harness.backend.count_records(""), 0);
}

#[test]
fn test_empty_share_counts_as_plain_approval() {
    let harness = setup(3);
    let id = harness
        .service
        .add(&caller("carol"), &policy_change(2))
        .expect("add");

    let outcome = harness
        .service
        .approve(&caller("alice"), id.as_str(), Some(SecretString::from("")))
        .expect("approve");
    assert_eq!(
        outcome,
        ApprovalOutcome::Pending {
            approvals: 1,
            required: 2
        }
    );
    assert_eq!(harness.backend.outstanding_wrapping_tokens(), 0);
}

#[test]
fn test_proposal_to_delete_a_policy() {
    let harness = setup(3);
    let raw = fields(json!({"Type": "Policy", "PolicyName": POLICY, "Proposed": ""}));
    let id = harness.service.add(&caller("carol"), &raw).expect("add");

    assert_eq!(
        harness
            .service
            .approve(&caller("alice"), id.as_str(), None)
            .expect("approve"),
        ApprovalOutcome::Approved
    );
    assert_eq!(harness.backend.policy(POLICY), None);
}

#[test]
fn test_rejected_request_is_gone() {
    let harness = setup(3);
    let id = harness
        .service
        .add(&caller("carol"), &policy_change(2))
        .expect("add");

    harness.service.reject(&caller("bob"), id.as_str()).expect("reject");
    assert!(matches!(
        harness.service.approve(&caller("alice"), id.as_str(), None),
        Err(ApprovalError::NotFound)
    ));
    assert!(matches!(
        harness.service.reject(&caller("alice"), id.as_str()),
        Err(ApprovalError::NotFound)
    ));
    assert_eq!(harness.backend.policy(POLICY).as_deref(), Some(CURRENT_DOCUMENT));
}

#[test_case("Proposed", json!("path \"*\" { capabilities = [\"sudo\"] }") ; "proposed document")]
#[test_case("RequiredApprovals", json!(1) ; "approval count")]
#[test_case("Requester", json!("mallory") ; "requester")]
#[test_case("Type", json!("POLICY") ; "type casing")]
#[test_case("Approvers", json!(["ghost1", "ghost2"]) ; "stuffed approvers")]
fn test_tampered_request_is_refused(field: &str, value: Value) {
    let harness = setup(3);
    let id = harness
        .service
        .add(&caller("carol"), &policy_change(2))
        .expect("add");
    harness
        .backend
        .tamper(&request_path(id.as_str()), field, value);

    let alice = caller("alice");
    assert!(matches!(
        harness.service.get(&alice, id.as_str()),
        Err(ApprovalError::IntegrityFailure(_))
    ));
    assert!(matches!(
        harness.service.approve(&alice, id.as_str(), None),
        Err(ApprovalError::IntegrityFailure(_))
    ));
    assert!(!harness.locks.is_held(id.as_str()));
    assert_eq!(harness.backend.policy(POLICY).as_deref(), Some(CURRENT_DOCUMENT));
}

#[test]
fn test_progress_sealed_under_another_key_is_refused() {
    let harness = setup(3);
    let id = harness
        .service
        .add(&caller("carol"), &policy_change(2))
        .expect("add");

    let other = ApprovalService::new(
        harness.backend.clone(),
        harness.locks.clone(),
        WorkflowConfig::default(),
        ProgressKey::from_bytes([0x11; KEY_LEN]),
    )
    .expect("service");
    assert!(matches!(
        other.get(&caller("alice"), id.as_str()),
        Err(ApprovalError::IntegrityFailure(_))
    ));
    assert!(matches!(
        other.approve(&caller("alice"), id.as_str(), None),
        Err(ApprovalError::IntegrityFailure(_))
    ));
    assert_eq!(harness.backend.policy(POLICY).as_deref(), Some(CURRENT_DOCUMENT));
}

#[test]
fn test_requester_cannot_approve_own_request() {
    let harness = setup(3);
    let raw = fields(json!({
        "Type": "policy",
        "PolicyName": POLICY,
        "Proposed": PROPOSED_DOCUMENT,
    }));
    let id = harness.service.add(&caller("carol"), &raw).expect("add");

    assert!(matches!(
        harness.service.approve(&caller("carol"), id.as_str(), None),
        Err(ApprovalError::ValidationFailed(_))
    ));
    assert_eq!(harness.backend.policy(POLICY).as_deref(), Some(CURRENT_DOCUMENT));
    assert!(!harness.locks.is_held(id.as_str()));

    assert_eq!(
        harness
            .service
            .approve(&caller("alice"), id.as_str(), None)
            .expect("alice"),
        ApprovalOutcome::Approved
    );
    assert_eq!(harness.backend.policy(POLICY).as_deref(), Some(PROPOSED_DOCUMENT));
}

#[test_case("Approvers", json!(["ghost1", "ghost2"]) ; "stuffed approvers")]
#[test_case("Proposed", json!("path \"*\" { capabilities = [\"sudo\"] }") ; "proposed document")]
fn test_repeated_add_refuses_tampered_pending_request(field: &str, value: Value) {
    let harness = setup(3);
    let id = harness
        .service
        .add(&caller("carol"), &policy_change(3))
        .expect("add");
    harness
        .backend
        .tamper(&request_path(id.as_str()), field, value);

    assert!(matches!(
        harness.service.add(&caller("bob"), &policy_change(3)),
        Err(ApprovalError::IntegrityFailure(_))
    ));
    assert!(!harness.locks.is_held(id.as_str()));
}

#[test]
fn test_garbled_request_is_refused() {
    let harness = setup(3);
    let id = harness
        .service
        .add(&caller("carol"), &policy_change(2))
        .expect("add");
    harness
        .backend
        .tamper(&request_path(id.as_str()), "RequiredApprovals", json!("two"));

    assert!(matches!(
        harness.service.get(&caller("alice"), id.as_str()),
        Err(ApprovalError::IntegrityFailure(_))
    ));

    harness
        .backend
        .tamper(&request_path(id.as_str()), "Type", json!("unknown"));
    assert!(matches!(
        harness.service.get(&caller("alice"), id.as_str()),
        Err(ApprovalError::InvalidType(_))
    ));
}

#[test]
fn test_out_of_band_change_makes_request_stale() {
    let harness = setup(3);
    let id = harness
        .service
        .add(&caller("carol"), &policy_change(2))
        .expect("add");
    harness.backend.set_policy(POLICY, "path \"other/*\" {}");

    let alice = caller("alice");
    assert!(matches!(
        harness.service.get(&alice, id.as_str()),
        Err(ApprovalError::StaleRequest(_))
    ));
    assert!(matches!(
        harness.service.approve(&alice, id.as_str(), None),
        Err(ApprovalError::StaleRequest(_))
    ));
    assert!(matches!(
        harness.service.reject(&alice, id.as_str()),
        Err(ApprovalError::StaleRequest(_))
    ));
    assert_eq!(harness.backend.policy(POLICY).as_deref(), Some("path \"other/*\" {}"));
}

#[test]
fn test_callers_without_access_are_refused() {
    let harness = setup(3);
    let mallory = caller("mallory");
    assert!(matches!(
        harness.service.add(&mallory, &policy_change(1)),
        Err(ApprovalError::ValidationFailed(_))
    ));

    let id = harness
        .service
        .add(&caller("carol"), &policy_change(1))
        .expect("add");
    for result in [
        harness.service.get(&mallory, id.as_str()).map(|_| ()),
        harness.service.approve(&mallory, id.as_str(), None).map(|_| ()),
        harness.service.reject(&mallory, id.as_str()),
    ] {
        assert!(matches!(
            result,
            Err(ApprovalError::Backend(BackendError::PermissionDenied(_)))
        ));
    }
    assert!(harness.backend.record(&request_path(id.as_str())).is_some());
}

#[test_case(json!({"PolicyName": POLICY, "Proposed": "x"}), "unsupported" ; "missing type")]
#[test_case(json!({"Type": "", "PolicyName": POLICY, "Proposed": "x"}), "unsupported" ; "empty type")]
#[test_case(json!({"Type": "token", "PolicyName": POLICY}), "unsupported" ; "unknown type")]
#[test_case(json!({"Type": "policy", "Proposed": "x"}), "validation" ; "missing policy name")]
#[test_case(json!({"Type": "policy", "PolicyName": POLICY, "Proposed": "x", "RequiredApprovals": 0}), "validation" ; "zero approvals")]
#[test_case(json!({"Type": "policy", "PolicyName": POLICY, "Proposed": "x", "Approvers": ["bob"]}), "validation" ; "preloaded approvers")]
#[test_case(json!({"Type": "policy", "PolicyName": POLICY, "Proposed": CURRENT_DOCUMENT}), "validation" ; "no-op change")]
fn test_add_refuses(raw: Value, expected: &str) {
    let harness = setup(3);
    let err = harness
        .service
        .add(&caller("carol"), &fields(raw))
        .expect_err("refused");
    match expected {
        "unsupported" => assert!(matches!(err, ApprovalError::UnsupportedType(_)), "{err}"),
        _ => assert!(matches!(err, ApprovalError::ValidationFailed(_)), "{err}"),
    }
    assert_eq!(harness.backend.count_records(""), 0);
}

#[test]
fn test_held_lock_is_a_conflict() {
    let harness = setup(3);
    let id = harness
        .service
        .add(&caller("carol"), &policy_change(2))
        .expect("add");

    assert!(harness.locks.acquire(id.as_str()));
    let alice = caller("alice");
    assert!(matches!(
        harness.service.get(&alice, id.as_str()),
        Err(ApprovalError::Conflict)
    ));
    assert!(matches!(
        harness.service.approve(&alice, id.as_str(), None),
        Err(ApprovalError::Conflict)
    ));
    assert!(matches!(
        harness.service.reject(&alice, id.as_str()),
        Err(ApprovalError::Conflict)
    ));
    assert!(matches!(
        harness.service.add(&caller("carol"), &policy_change(2)),
        Err(ApprovalError::Conflict)
    ));

    // The failed calls must not have released the holder's claim.
    assert!(harness.locks.is_held(id.as_str()));
    harness.locks.release(id.as_str());
    harness.service.get(&alice, id.as_str()).expect("get after release");
}

#[test]
fn test_concurrent_operation_on_same_request_conflicts() {
    init_test_logging();
    let harness = setup(3);
    let id = harness
        .service
        .add(&caller("carol"), &policy_change(2))
        .expect("add");
    let other = harness
        .service
        .add(&caller("carol"), &fields(json!({"Type": "policy", "PolicyName": POLICY, "Proposed": ""})))
        .expect("add");

    let gated = Arc::new(GatedBackend::new(harness.backend.clone()));
    let locks = Arc::new(MemoryLockRegistry::new());
    let service = Arc::new(
        ApprovalService::new(
            gated.clone(),
            locks.clone(),
            WorkflowConfig::default(),
            progress_key(),
        )
        .expect("service"),
    );

    let gate = gated.arm();
    let parked = {
        let service = Arc::clone(&service);
        let id = id.clone();
        thread::spawn(move || service.approve(&caller("alice"), id.as_str(), None))
    };
    gate.wait_entered();

    // alice is parked inside the load preamble, holding the request's lock.
    assert!(locks.is_held(id.as_str()));
    assert!(matches!(
        service.approve(&caller("bob"), id.as_str(), None),
        Err(ApprovalError::Conflict)
    ));
    // Other requests are unaffected.
    service.get(&caller("bob"), other.as_str()).expect("other request");

    gate.open();
    assert_eq!(
        parked.join().expect("thread").expect("alice"),
        ApprovalOutcome::Pending {
            approvals: 1,
            required: 2
        }
    );
    assert!(!locks.is_held(id.as_str()));
    assert_eq!(
        service
            .approve(&caller("bob"), id.as_str(), None)
            .expect("bob"),
        ApprovalOutcome::Approved
    );
}

#[test]
fn test_custom_prefixes_are_honoured() {
    let config = WorkflowConfig {
        request_prefix: "approvals/pending/".to_string(),
        ..WorkflowConfig::default()
    };
    let harness = common::setup_with(3, config);
    let id = harness
        .service
        .add(&caller("carol"), &policy_change(2))
        .expect("add");
    assert!(harness
        .backend
        .record(&format!("approvals/pending/{id}"))
        .is_some());
    assert_eq!(harness.backend.count_records("requests/"), 0);
}
