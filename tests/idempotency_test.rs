mod common;

use axum::http::{Method, StatusCode};
use chrono::{Duration, Utc};
use common::{session_payload, TestApp};
use hostedpay_api::entities::{idempotency_record, payment_attempt};
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use serde_json::json;
use uuid::Uuid;

async fn create_session(app: &TestApp, store_id: Uuid) -> Uuid {
    let (status, session) = app
        .post(
            "/api/v1/checkout/sessions",
            session_payload(store_id, "20.00"),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    session["id"].as_str().unwrap().parse().unwrap()
}

async fn initiate_with_key(app: &TestApp, session_id: Uuid, key: &str) -> (StatusCode, serde_json::Value) {
    app.request(
        Method::POST,
        &format!("/api/v1/checkout/sessions/{}/initiate-payment", session_id),
        Some(json!({})),
        &[("idempotency-key", key)],
    )
    .await
}

#[tokio::test]
async fn replay_returns_stored_response_without_reexecuting() {
    let app = TestApp::new().await;
    let store_id = Uuid::new_v4();
    let session_id = create_session(&app, store_id).await;

    let (status, first) = initiate_with_key(&app, session_id, "key-replay").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["status"], "processing");
    assert_eq!(first["attempt_count"], 1);

    // Same key, same request: the stored response comes back verbatim and no
    // second attempt is made.
    let (status, replay) = initiate_with_key(&app, session_id, "key-replay").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(replay, first);

    let attempts = payment_attempt::Entity::find()
        .all(&*app.state.db)
        .await
        .unwrap();
    assert_eq!(attempts.len(), 1);
}

#[tokio::test]
async fn finalized_replays_are_served_from_the_cache() {
    let app = TestApp::new().await;
    let store_id = Uuid::new_v4();
    let session_id = create_session(&app, store_id).await;

    let (status, first) = initiate_with_key(&app, session_id, "key-cached").await;
    assert_eq!(status, StatusCode::OK);

    // Drop the durable record; the cached copy alone must carry the replay.
    idempotency_record::Entity::delete_by_id("key-cached")
        .exec(&*app.state.db)
        .await
        .unwrap();

    let (status, replay) = initiate_with_key(&app, session_id, "key-cached").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(replay, first);

    let attempts = payment_attempt::Entity::find()
        .all(&*app.state.db)
        .await
        .unwrap();
    assert_eq!(attempts.len(), 1);
}

#[tokio::test]
async fn replay_preserves_the_stored_status_code() {
    let app = TestApp::new().await;
    let store_id = Uuid::new_v4();
    let session_id = create_session(&app, store_id).await;

    let body = json!({ "session_id": session_id.to_string() });
    let svc = &app.state.services.idempotency;
    svc.check_or_create("key-status", store_id, "initiate-payment", &body)
        .await
        .unwrap();
    let stored = json!({ "status": "processing", "note": "finalized earlier" });
    svc.set_response("key-status", 202, stored.clone())
        .await
        .unwrap();

    let (status, replay) = initiate_with_key(&app, session_id, "key-status").await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(replay, stored);
}

#[tokio::test]
async fn key_reuse_with_a_different_target_conflicts() {
    let app = TestApp::new().await;
    let store_id = Uuid::new_v4();
    let first_session = create_session(&app, store_id).await;
    let second_session = create_session(&app, store_id).await;

    let (status, _) = initiate_with_key(&app, first_session, "key-shared").await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = initiate_with_key(&app, second_session, "key-shared").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["message"]
        .as_str()
        .is_some_and(|m| m.contains("different request")));
}

#[tokio::test]
async fn in_flight_key_is_rejected_until_finished() {
    let app = TestApp::new().await;
    let store_id = Uuid::new_v4();
    let session_id = create_session(&app, store_id).await;

    // Claim the key the way the handler would, but never finish.
    let body = json!({ "session_id": session_id.to_string() });
    let outcome = app
        .state
        .services
        .idempotency
        .check_or_create("key-stuck", store_id, "initiate-payment", &body)
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        hostedpay_api::services::idempotency::IdempotencyOutcome::New
    ));

    let (status, _) = initiate_with_key(&app, session_id, "key-stuck").await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn failed_execution_releases_the_key_for_retry() {
    let app = TestApp::new().await;
    let store_id = Uuid::new_v4();
    let session_id = create_session(&app, store_id).await;

    app.psp
        .enqueue(hostedpay_api::psp::MockIntentOutcome::Fail {
            code: "card_declined".to_string(),
            message: "do not honor".to_string(),
        });
    let (status, _) = initiate_with_key(&app, session_id, "key-retry").await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);

    // The failure produced no replayable response; the same key works again.
    let (status, view) = initiate_with_key(&app, session_id, "key-retry").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["status"], "processing");
}

#[tokio::test]
async fn cleanup_sweep_drops_only_records_past_retention() {
    let app = TestApp::new().await;
    let store_id = Uuid::new_v4();
    let svc = &app.state.services.idempotency;

    svc.check_or_create("key-old", store_id, "initiate-payment", &json!({ "n": 1 }))
        .await
        .unwrap();
    svc.check_or_create("key-new", store_id, "initiate-payment", &json!({ "n": 2 }))
        .await
        .unwrap();

    // Age one record past its retention deadline.
    let row = idempotency_record::Entity::find_by_id("key-old")
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    let mut active: idempotency_record::ActiveModel = row.into();
    active.expires_at = Set(Utc::now() - Duration::days(1));
    active.update(&*app.state.db).await.unwrap();

    assert_eq!(svc.cleanup_expired(Utc::now()).await.unwrap(), 1);
    assert!(idempotency_record::Entity::find_by_id("key-old")
        .one(&*app.state.db)
        .await
        .unwrap()
        .is_none());
    assert!(idempotency_record::Entity::find_by_id("key-new")
        .one(&*app.state.db)
        .await
        .unwrap()
        .is_some());

    // A second pass finds nothing due.
    assert_eq!(svc.cleanup_expired(Utc::now()).await.unwrap(), 0);
}

#[tokio::test]
async fn requests_without_a_key_are_never_deduplicated() {
    let app = TestApp::new().await;
    let store_id = Uuid::new_v4();
    let session_id = create_session(&app, store_id).await;

    let uri = format!("/api/v1/checkout/sessions/{}/initiate-payment", session_id);
    let (status, _) = app.post(&uri, json!({})).await;
    assert_eq!(status, StatusCode::OK);

    // A keyless repeat is an ordinary call; the session is already
    // processing, so it is refused rather than replayed.
    let (status, _) = app.post(&uri, json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
