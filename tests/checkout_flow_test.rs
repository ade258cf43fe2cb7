mod common;

use axum::http::{Method, StatusCode};
use chrono::{Duration, Utc};
use common::{dec_field, psp_event, session_payload, TestApp};
use hostedpay_api::entities::{
    balance_transaction, payment, webhook_delivery, webhook_event,
    balance_transaction::TransactionType, payment::PaymentStatus,
    webhook_delivery::DeliveryStatus,
};
use rust_decimal_macros::dec;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use serde_json::json;
use uuid::Uuid;

#[tokio::test]
async fn full_checkout_flow_with_customer_action() {
    let app = TestApp::new().await;
    let store_id = Uuid::new_v4();

    // Subscribe a merchant endpoint so settlement fans out deliveries.
    let (status, endpoint) = app
        .post(
            "/api/v1/webhook-endpoints",
            json!({
                "store_id": store_id.to_string(),
                "url": "https://merchant.example/hooks",
                "event_types": ["payment.completed", "checkout.completed"],
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(endpoint["secret"]
        .as_str()
        .is_some_and(|s| s.starts_with("whsec_")));

    let (status, session) = app
        .post(
            "/api/v1/checkout/sessions",
            session_payload(store_id, "99.99"),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(session["status"], "open");
    assert_eq!(session["amount"], "99.99");
    let session_id: Uuid = session["id"].as_str().unwrap().parse().unwrap();

    // Provider demands 3DS on the first intent.
    app.psp
        .enqueue(hostedpay_api::psp::MockIntentOutcome::RequireAction {
            redirect_url: "https://psp.example/3ds/abc".to_string(),
        });
    let (status, view) = app
        .post(
            &format!("/api/v1/checkout/sessions/{}/initiate-payment", session_id),
            json!({}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["status"], "awaiting_action");
    assert_eq!(view["redirect_url"], "https://psp.example/3ds/abc");
    assert_eq!(view["attempt_count"], 1);

    // Customer completes the challenge; provider confirms, then settles.
    let (status, ack) = app
        .deliver_psp_event(&psp_event("payment.action_completed", session_id, json!({})))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["received"], true);

    let (_, view) = app
        .get(&format!("/api/v1/checkout/sessions/{}", session_id))
        .await;
    assert_eq!(view["status"], "processing");

    let (status, _) = app
        .deliver_psp_event(&psp_event(
            "payment.succeeded",
            session_id,
            json!({ "amount": "99.99" }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (_, view) = app
        .get(&format!("/api/v1/checkout/sessions/{}", session_id))
        .await;
    assert_eq!(view["status"], "completed");
    assert!(!view["completed_at"].is_null());

    // Payment row settled with the platform fee carved out (2.9% of 99.99).
    let paid = payment::Entity::find()
        .filter(payment::Column::SessionId.eq(session_id))
        .one(&*app.state.db)
        .await
        .unwrap()
        .expect("payment row exists");
    assert_eq!(paid.status, PaymentStatus::Succeeded);
    assert_eq!(paid.platform_fee, dec!(2.90));
    assert_eq!(paid.net_amount, dec!(97.09));

    // Two ledger rows: gross in, fee out.
    let rows = balance_transaction::Entity::find()
        .filter(balance_transaction::Column::StoreId.eq(store_id))
        .all(&*app.state.db)
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    let received = rows
        .iter()
        .find(|r| r.transaction_type == TransactionType::PaymentReceived)
        .unwrap();
    assert_eq!(received.amount, dec!(99.99));
    let fee = rows
        .iter()
        .find(|r| r.transaction_type == TransactionType::Fee)
        .unwrap();
    assert_eq!(fee.amount, dec!(-2.90));

    let (status, balances) = app
        .get(&format!("/api/v1/stores/{}/balance", store_id))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(balances["balances"][0]["currency"], "USD");
    assert_eq!(dec_field(&balances["balances"][0]["balance"]), dec!(97.09));

    // Settlement recorded both business events and queued their deliveries.
    let events = webhook_event::Entity::find()
        .filter(webhook_event::Column::StoreId.eq(store_id))
        .all(&*app.state.db)
        .await
        .unwrap();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert!(types.contains(&"payment.completed"));
    assert!(types.contains(&"checkout.completed"));

    let deliveries = webhook_delivery::Entity::find()
        .all(&*app.state.db)
        .await
        .unwrap();
    assert_eq!(deliveries.len(), 2);
    assert!(deliveries
        .iter()
        .all(|d| d.status == DeliveryStatus::Pending));

    // A redelivered settlement for the now-terminal session changes nothing.
    let (status, _) = app
        .deliver_psp_event(&psp_event(
            "payment.succeeded",
            session_id,
            json!({ "amount": "99.99" }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    let count = balance_transaction::Entity::find()
        .filter(balance_transaction::Column::StoreId.eq(store_id))
        .all(&*app.state.db)
        .await
        .unwrap()
        .len();
    assert_eq!(count, 2);
}

#[tokio::test]
async fn declined_attempt_reopens_session_for_retry() {
    let app = TestApp::new().await;
    let store_id = Uuid::new_v4();
    let (_, session) = app
        .post(
            "/api/v1/checkout/sessions",
            session_payload(store_id, "25.00"),
        )
        .await;
    let session_id = session["id"].as_str().unwrap();

    app.psp
        .enqueue(hostedpay_api::psp::MockIntentOutcome::Fail {
            code: "card_declined".to_string(),
            message: "insufficient funds".to_string(),
        });
    let (status, _) = app
        .post(
            &format!("/api/v1/checkout/sessions/{}/initiate-payment", session_id),
            json!({}),
        )
        .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);

    let (_, view) = app
        .get(&format!("/api/v1/checkout/sessions/{}", session_id))
        .await;
    assert_eq!(view["status"], "open");
    assert_eq!(view["attempt_count"], 1);
    assert!(!view["last_error"].is_null());

    // Second attempt goes through; the burnt attempt stays on the record.
    let (status, view) = app
        .post(
            &format!("/api/v1/checkout/sessions/{}/initiate-payment", session_id),
            json!({}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["status"], "processing");
    assert_eq!(view["attempt_count"], 2);
}

#[tokio::test]
async fn session_expires_after_exhausting_attempts() {
    let app = TestApp::new().await;
    let store_id = Uuid::new_v4();
    let (_, session) = app
        .post(
            "/api/v1/checkout/sessions",
            session_payload(store_id, "10.00"),
        )
        .await;
    let session_id = session["id"].as_str().unwrap();
    let uri = format!("/api/v1/checkout/sessions/{}/initiate-payment", session_id);

    for _ in 0..3 {
        app.psp
            .enqueue(hostedpay_api::psp::MockIntentOutcome::Fail {
                code: "card_declined".to_string(),
                message: "do not honor".to_string(),
            });
        let (status, _) = app.post(&uri, json!({})).await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    }

    let (_, view) = app
        .get(&format!("/api/v1/checkout/sessions/{}", session_id))
        .await;
    assert_eq!(view["status"], "expired");
    assert_eq!(view["attempt_count"], 3);

    // No fourth attempt against a retired session.
    let (status, _) = app.post(&uri, json!({})).await;
    assert_eq!(status, StatusCode::GONE);
}

#[tokio::test]
async fn mismatched_settlement_amount_never_settles() {
    let app = TestApp::new().await;
    let store_id = Uuid::new_v4();
    let (_, session) = app
        .post(
            "/api/v1/checkout/sessions",
            session_payload(store_id, "99.99"),
        )
        .await;
    let session_id: Uuid = session["id"].as_str().unwrap().parse().unwrap();

    let (status, _) = app
        .post(
            &format!("/api/v1/checkout/sessions/{}/initiate-payment", session_id),
            json!({}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    // The discrepancy is reported back to the provider, not acknowledged.
    let (status, body) = app
        .deliver_psp_event(&psp_event(
            "payment.succeeded",
            session_id,
            json!({ "amount": "50.00" }),
        ))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["message"]
        .as_str()
        .is_some_and(|m| m.contains("mismatch")));

    let (_, view) = app
        .get(&format!("/api/v1/checkout/sessions/{}", session_id))
        .await;
    assert_ne!(view["status"], "completed");
    assert!(view["last_error"]
        .as_str()
        .is_some_and(|e| e.contains("amount mismatch")));

    let rows = balance_transaction::Entity::find()
        .filter(balance_transaction::Column::StoreId.eq(store_id))
        .all(&*app.state.db)
        .await
        .unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn expiry_sweep_retires_overdue_sessions() {
    let app = TestApp::new().await;
    let store_id = Uuid::new_v4();
    let (_, session) = app
        .post(
            "/api/v1/checkout/sessions",
            session_payload(store_id, "18.00"),
        )
        .await;
    let session_id: Uuid = session["id"].as_str().unwrap().parse().unwrap();

    // A declined attempt leaves the session open with an unsettled payment.
    app.psp
        .enqueue(hostedpay_api::psp::MockIntentOutcome::Fail {
            code: "card_declined".to_string(),
            message: "do not honor".to_string(),
        });
    let (status, _) = app
        .post(
            &format!("/api/v1/checkout/sessions/{}/initiate-payment", session_id),
            json!({}),
        )
        .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);

    // Nothing is due yet.
    let swept = app
        .state
        .services
        .checkout
        .expire_due_sessions(Utc::now())
        .await
        .unwrap();
    assert_eq!(swept, 0);

    // One sweep pass past the deadline retires the session.
    let later = Utc::now() + Duration::minutes(app.state.config.session_ttl_minutes + 1);
    let swept = app
        .state
        .services
        .checkout
        .expire_due_sessions(later)
        .await
        .unwrap();
    assert_eq!(swept, 1);

    let (_, view) = app
        .get(&format!("/api/v1/checkout/sessions/{}", session_id))
        .await;
    assert_eq!(view["status"], "expired");

    let paid = payment::Entity::find()
        .filter(payment::Column::SessionId.eq(session_id))
        .one(&*app.state.db)
        .await
        .unwrap()
        .expect("payment row exists");
    assert_eq!(paid.status, PaymentStatus::Failed);

    // The merchant is told the session expired.
    let events = webhook_event::Entity::find()
        .filter(webhook_event::Column::StoreId.eq(store_id))
        .all(&*app.state.db)
        .await
        .unwrap();
    assert!(events.iter().any(|e| e.event_type == "checkout.expired"));

    // Retired sessions are not picked up again.
    let swept = app
        .state
        .services
        .checkout
        .expire_due_sessions(later)
        .await
        .unwrap();
    assert_eq!(swept, 0);
}

#[tokio::test]
async fn abandon_is_terminal() {
    let app = TestApp::new().await;
    let store_id = Uuid::new_v4();
    let (_, session) = app
        .post(
            "/api/v1/checkout/sessions",
            session_payload(store_id, "15.00"),
        )
        .await;
    let session_id = session["id"].as_str().unwrap();

    let (status, view) = app
        .post(
            &format!("/api/v1/checkout/sessions/{}/abandon", session_id),
            json!({}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["status"], "abandoned");
    assert!(!view["abandoned_at"].is_null());

    let (status, _) = app
        .post(
            &format!("/api/v1/checkout/sessions/{}/abandon", session_id),
            json!({}),
        )
        .await;
    assert_eq!(status, StatusCode::GONE);
}

#[tokio::test]
async fn payment_requires_customer_identity() {
    let app = TestApp::new().await;
    let store_id = Uuid::new_v4();

    // No email, no customer id.
    let (status, session) = app
        .post(
            "/api/v1/checkout/sessions",
            json!({
                "store_id": store_id.to_string(),
                "page_id": Uuid::new_v4().to_string(),
                "amount": "30.00",
                "currency": "USD",
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let session_id = session["id"].as_str().unwrap();

    let uri = format!("/api/v1/checkout/sessions/{}/initiate-payment", session_id);
    let (status, _) = app.post(&uri, json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .request(
            Method::PATCH,
            &format!("/api/v1/checkout/sessions/{}", session_id),
            Some(json!({ "customer_email": "late@example.com" })),
            &[],
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, view) = app.post(&uri, json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["status"], "processing");
}

#[tokio::test]
async fn custom_amount_sessions_accept_amount_updates() {
    let app = TestApp::new().await;
    let store_id = Uuid::new_v4();
    let (status, session) = app
        .post(
            "/api/v1/checkout/sessions",
            json!({
                "store_id": store_id.to_string(),
                "page_id": Uuid::new_v4().to_string(),
                "amount": "0",
                "currency": "USD",
                "allow_custom_amount": true,
                "customer_email": "fan@example.com",
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let session_id = session["id"].as_str().unwrap();

    let (status, view) = app
        .request(
            Method::PATCH,
            &format!("/api/v1/checkout/sessions/{}", session_id),
            Some(json!({ "amount": "42.00" })),
            &[],
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["amount"], "42.00");
}

#[tokio::test]
async fn create_rejects_invalid_amounts() {
    let app = TestApp::new().await;
    let store_id = Uuid::new_v4();

    let (status, _) = app
        .post(
            "/api/v1/checkout/sessions",
            session_payload(store_id, "-5.00"),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Zero is only meaningful for pay-what-you-want pages.
    let (status, _) = app
        .post("/api/v1/checkout/sessions", session_payload(store_id, "0"))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unsigned_provider_callbacks_are_rejected() {
    let app = TestApp::new().await;

    let (status, _) = app
        .post("/api/v1/psp/webhook", json!({ "id": "evt_x" }))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .request(
            Method::POST,
            "/api/v1/psp/webhook",
            Some(json!({ "id": "evt_x" })),
            &[("psp-signature", "t=0,v1=deadbeef")],
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}
