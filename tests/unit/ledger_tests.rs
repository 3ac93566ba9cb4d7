use chrono::{Duration, Utc};

use agent_continuity::models::handoff::{FileReservation, Resource, ReservationMode};
use agent_continuity::orchestrator::handoff::ResourceTransfer;
use agent_continuity::orchestrator::ledger::ResourceLedger;

fn reservation(expires_in: Option<Duration>) -> Resource {
    Resource::FileReservation(FileReservation {
        id: "r1".into(),
        patterns: vec!["src/**".into()],
        mode: ReservationMode::Shared,
        expires_at: expires_in.map(|d| Utc::now() + d),
    })
}

#[test]
fn move_assigns_new_owner() {
    let ledger = ResourceLedger::new();
    ledger.claim("checkpoint:c1", "a");

    ledger
        .move_resource(&Resource::Checkpoint("c1".into()), "a", "b")
        .expect("move");
    assert_eq!(ledger.owner("checkpoint:c1").as_deref(), Some("b"));
    assert!(ledger.held_by("a").is_empty());
}

#[test]
fn move_of_unowned_resource_claims_it() {
    let ledger = ResourceLedger::new();
    ledger
        .move_resource(&Resource::PendingMessage("m1".into()), "a", "b")
        .expect("move");
    assert_eq!(ledger.held_by("b"), vec!["message:m1".to_owned()]);
}

#[test]
fn third_party_owner_is_fatal() {
    let ledger = ResourceLedger::new();
    ledger.claim("subscription:s1", "c");

    let err = ledger
        .move_resource(&Resource::Subscription("s1".into()), "a", "b")
        .unwrap_err();
    assert!(!err.recoverable);
    assert!(err.to_string().contains("held by c"));
    assert_eq!(ledger.owner("subscription:s1").as_deref(), Some("c"));
}

#[test]
fn expired_reservation_is_recoverable() {
    let ledger = ResourceLedger::new();
    let err = ledger
        .move_resource(&reservation(Some(Duration::seconds(-1))), "a", "b")
        .unwrap_err();
    assert!(err.recoverable);
    assert!(ledger.owner("reservation:r1").is_none());

    ledger
        .move_resource(&reservation(Some(Duration::minutes(5))), "a", "b")
        .expect("live reservation");
    assert_eq!(ledger.owner("reservation:r1").as_deref(), Some("b"));
}

#[test]
fn held_by_is_sorted() {
    let ledger = ResourceLedger::new();
    ledger.claim("message:z", "a");
    ledger.claim("checkpoint:b", "a");
    ledger.claim("message:q", "other");
    assert_eq!(
        ledger.held_by("a"),
        vec!["checkpoint:b".to_owned(), "message:z".to_owned()]
    );
}

#[tokio::test]
async fn transfer_trait_delegates_to_move() {
    let ledger = ResourceLedger::new();
    ledger
        .transfer(&Resource::Checkpoint("c1".into()), "a", "b")
        .await
        .expect("transfer");
    assert_eq!(ledger.owner("checkpoint:c1").as_deref(), Some("b"));
}
