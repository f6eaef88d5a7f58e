//! Tests for the auth set state engine.

use super::engine::{Decision, DeviceAuthEngine, DeviceError};
use crate::identity::identity_hash;
use crate::storage::{DeviceDatabase, Status};

const ID_1: &str = r#"{"sn":"0001","mac":"00:00:00:01"}"#;
const ID_2: &str = r#"{"sn":"0002","mac":"00:00:00:02"}"#;

async fn test_engine() -> DeviceAuthEngine {
    DeviceAuthEngine::new(DeviceDatabase::open_in_memory().await.unwrap())
}

#[tokio::test]
async fn submit_creates_pending_device_and_auth_set() {
    let engine = test_engine().await;
    let auth_set = engine.submit_auth_set(None, ID_1, "KEY-1").await.unwrap();

    assert_eq!(auth_set.status, Status::Pending);
    assert_eq!(auth_set.identity_hash, hex::encode(identity_hash(ID_1)));
    assert_eq!(auth_set.identity_struct, r#"{"mac":"00:00:00:01","sn":"0001"}"#);

    let device = engine.device(&auth_set.device_id).await.unwrap();
    assert_eq!(device.status, Status::Pending);
    assert_eq!(device.identity_data, ID_1);
    assert_eq!(device.identity_hash, auth_set.identity_hash);
    assert_eq!(device.public_key, "");
}

#[tokio::test]
async fn submit_uses_requested_device_id() {
    let engine = test_engine().await;
    let auth_set = engine.submit_auth_set(Some("dev-1"), ID_1, "K").await.unwrap();
    assert_eq!(auth_set.device_id, "dev-1");
}

#[tokio::test]
async fn same_identity_reuses_device() {
    let engine = test_engine().await;
    let a = engine.submit_auth_set(None, ID_1, "KEY-1").await.unwrap();
    let b = engine.submit_auth_set(None, ID_1, "KEY-2").await.unwrap();

    assert_eq!(a.device_id, b.device_id);
    assert_ne!(a.id, b.id);
    assert_eq!(engine.db().list_devices(None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn identical_resubmission_returns_existing_auth_set() {
    let engine = test_engine().await;
    let a = engine.submit_auth_set(None, ID_1, "KEY-1").await.unwrap();
    engine.decide_auth_set(&a.id, Decision::Accept).await.unwrap();

    let again = engine.submit_auth_set(None, ID_1, "KEY-1").await.unwrap();
    assert_eq!(again.id, a.id);
    assert_eq!(again.status, Status::Accepted);
    assert_eq!(engine.list_auth_sets(&a.device_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn hash_match_wins_over_requested_id() {
    let engine = test_engine().await;
    let a = engine.submit_auth_set(Some("first"), ID_1, "K").await.unwrap();
    let b = engine.submit_auth_set(Some("second"), ID_1, "K2").await.unwrap();
    assert_eq!(a.device_id, "first");
    assert_eq!(b.device_id, "first");
    assert!(engine.device("second").await.is_err());
}

#[tokio::test]
async fn different_identity_can_attach_to_known_device() {
    let engine = test_engine().await;
    engine.submit_auth_set(Some("dev"), ID_1, "K").await.unwrap();
    let b = engine
        .submit_auth_set(Some("dev"), r#"{"sn":"0001","mac":"00:00:00:01","attr":"x"}"#, "K")
        .await
        .unwrap();

    assert_eq!(b.device_id, "dev");
    assert_eq!(engine.list_auth_sets("dev").await.unwrap().len(), 2);
    // The device keeps the identity it was first seen with.
    assert_eq!(engine.device("dev").await.unwrap().identity_data, ID_1);
}

#[tokio::test]
async fn malformed_identity_is_rejected_without_writes() {
    let engine = test_engine().await;
    let err = engine
        .submit_auth_set(None, r#"{"sn":1}"#, "K")
        .await
        .unwrap_err();
    assert!(matches!(err, DeviceError::MalformedIdentity(_)));
    assert!(engine.db().list_devices(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_submissions_create_one_device() {
    let engine = test_engine().await;
    let (a, b) = tokio::join!(
        engine.submit_auth_set(None, ID_1, "KEY-A"),
        engine.submit_auth_set(None, ID_1, "KEY-B"),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.device_id, b.device_id);
    assert_eq!(engine.db().list_devices(None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn accept_sets_status_and_public_key() {
    let engine = test_engine().await;
    let a = engine.submit_auth_set(None, ID_1, "KEY-1").await.unwrap();

    let outcome = engine.decide_auth_set(&a.id, Decision::Accept).await.unwrap();
    assert_eq!(outcome.auth_set.status, Status::Accepted);
    assert_eq!(outcome.device.status, Status::Accepted);
    assert_eq!(outcome.device.public_key, "KEY-1");
    assert!(!outcome.revoke_tokens);

    assert_eq!(
        engine.get_device_status(&a.device_id).await.unwrap(),
        Status::Accepted
    );
}

#[tokio::test]
async fn leaving_accepted_signals_revocation() {
    let engine = test_engine().await;
    let a = engine.submit_auth_set(None, ID_1, "KEY-1").await.unwrap();
    engine.decide_auth_set(&a.id, Decision::Accept).await.unwrap();

    let outcome = engine.decide_auth_set(&a.id, Decision::Reject).await.unwrap();
    assert!(outcome.revoke_tokens);
    assert_eq!(outcome.device.status, Status::Rejected);
    // The key of the last accepted auth set is kept for reference.
    assert_eq!(outcome.device.public_key, "KEY-1");

    // Rejecting a pending auth set is not a revocation.
    let b = engine.submit_auth_set(None, ID_1, "KEY-2").await.unwrap();
    let outcome = engine.decide_auth_set(&b.id, Decision::Reject).await.unwrap();
    assert!(!outcome.revoke_tokens);
}

#[tokio::test]
async fn second_accept_is_refused() {
    let engine = test_engine().await;
    let a = engine.submit_auth_set(None, ID_1, "KEY-1").await.unwrap();
    let b = engine.submit_auth_set(None, ID_1, "KEY-2").await.unwrap();
    engine.decide_auth_set(&a.id, Decision::Accept).await.unwrap();

    let err = engine.decide_auth_set(&b.id, Decision::Accept).await.unwrap_err();
    match err {
        DeviceError::MultipleAcceptedAuthSets { auth_set_ids, .. } => {
            assert_eq!(auth_set_ids, [a.id.clone(), b.id.clone()]);
        }
        other => panic!("unexpected error: {other}"),
    }

    // Nothing was written.
    assert_eq!(engine.auth_set(&b.id).await.unwrap().status, Status::Pending);
    let device = engine.device(&a.device_id).await.unwrap();
    assert_eq!(device.status, Status::Accepted);
    assert_eq!(device.public_key, "KEY-1");
}

#[tokio::test]
async fn double_accept_in_storage_surfaces_on_recompute() {
    let engine = test_engine().await;
    let a = engine.submit_auth_set(None, ID_1, "KEY-1").await.unwrap();
    let b = engine.submit_auth_set(None, ID_1, "KEY-2").await.unwrap();

    // Both writes landed, as two racing decisions could leave them.
    engine.db().update_auth_set_status(&a.id, Status::Accepted).await.unwrap();
    engine.db().update_auth_set_status(&b.id, Status::Accepted).await.unwrap();

    let err = engine.recompute_device_status(&a.device_id).await.unwrap_err();
    assert!(matches!(err, DeviceError::MultipleAcceptedAuthSets { .. }));

    let err = engine.decide_auth_set(&a.id, Decision::Reject).await;
    assert!(err.is_ok(), "rejecting one of them resolves the conflict");
    assert_eq!(
        engine.get_device_status(&a.device_id).await.unwrap(),
        Status::Accepted
    );
}

#[tokio::test]
async fn switching_accepted_key_requires_reject_first() {
    let engine = test_engine().await;
    let a = engine.submit_auth_set(None, ID_1, "KEY-1").await.unwrap();
    let b = engine.submit_auth_set(None, ID_1, "KEY-2").await.unwrap();

    engine.decide_auth_set(&a.id, Decision::Accept).await.unwrap();
    engine.decide_auth_set(&a.id, Decision::Reject).await.unwrap();
    let outcome = engine.decide_auth_set(&b.id, Decision::Accept).await.unwrap();

    assert_eq!(outcome.device.status, Status::Accepted);
    assert_eq!(outcome.device.public_key, "KEY-2");
}

#[tokio::test]
async fn updated_at_moves_only_on_change() {
    let engine = test_engine().await;
    let a = engine.submit_auth_set(None, ID_2, "K").await.unwrap();
    let before = engine.device(&a.device_id).await.unwrap();

    engine
        .db()
        .update_device_status(&a.device_id, before.status, &before.public_key, 7)
        .await
        .unwrap();
    let unchanged = engine.recompute_device_status(&a.device_id).await.unwrap();
    assert_eq!(unchanged.updated_at, 7);

    let changed = engine.decide_auth_set(&a.id, Decision::Reject).await.unwrap();
    assert!(changed.device.updated_at > 7);
}

#[tokio::test]
async fn unknown_ids_are_typed_errors() {
    let engine = test_engine().await;
    assert!(matches!(
        engine.decide_auth_set("nope", Decision::Accept).await,
        Err(DeviceError::AuthSetNotFound(_))
    ));
    assert!(matches!(
        engine.get_device_status("nope").await,
        Err(DeviceError::DeviceNotFound(_))
    ));
    assert!(matches!(
        engine.decommission_device("nope").await,
        Err(DeviceError::DeviceNotFound(_))
    ));
}

#[tokio::test]
async fn decommission_keeps_status() {
    let engine = test_engine().await;
    let a = engine.submit_auth_set(None, ID_1, "K").await.unwrap();
    engine.decide_auth_set(&a.id, Decision::Accept).await.unwrap();

    let device = engine.decommission_device(&a.device_id).await.unwrap();
    assert!(device.decommissioning);
    assert_eq!(device.status, Status::Accepted);
    assert_eq!(engine.list_auth_sets(&a.device_id).await.unwrap().len(), 1);
}
