// Each test binary uses a different slice of this harness.
#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use hostedpay_api::{
    app_router,
    cache::InMemoryCache,
    config::AppConfig,
    db, events,
    psp::MockPsp,
    AppState,
};
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

/// Test harness: the full application router over an in-memory SQLite
/// database, with the scriptable mock provider kept accessible so tests can
/// enqueue intent outcomes and forge signed provider callbacks.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub psp: Arc<MockPsp>,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            "redis://127.0.0.1:6379".to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        // A pool larger than one would hand each connection its own
        // private in-memory database.
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        let cfg = Arc::new(cfg);

        let pool = Arc::new(
            db::establish_connection_from_app_config(&cfg)
                .await
                .expect("failed to open test database"),
        );
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let cache = Arc::new(InMemoryCache::new());
        let psp = Arc::new(MockPsp::new("whsec_test_secret"));

        let (event_sender, event_receiver) = events::channel(cfg.event_channel_capacity);
        let event_task = events::spawn_event_logger(event_receiver);

        let state = AppState::new(pool, cfg, cache, psp.clone(), event_sender);
        let router = app_router(state.clone());

        Self {
            router,
            state,
            psp,
            _event_task: event_task,
        }
    }

    /// Sends one request through the router and decodes the JSON body.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }

        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("failed to build request");

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router never fails");

        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("failed to read response body")
            .to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.request(Method::GET, uri, None, &[]).await
    }

    pub async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.request(Method::POST, uri, Some(body), &[]).await
    }

    /// Delivers a signed provider callback to the inbound webhook route.
    pub async fn deliver_psp_event(
        &self,
        event: &hostedpay_api::psp::PspEvent,
    ) -> (StatusCode, Value) {
        let (body, signature) = self.psp.signed_event(event);
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/psp/webhook")
            .header("content-type", "application/json")
            .header("psp-signature", signature)
            .body(Body::from(body))
            .expect("failed to build webhook request");

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router never fails");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("failed to read response body")
            .to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }
}

/// Builds a provider event carrying the session id the way intent metadata
/// echoes it back.
pub fn psp_event(event_type: &str, session_id: Uuid, data: Value) -> hostedpay_api::psp::PspEvent {
    hostedpay_api::psp::PspEvent {
        id: format!("evt_{}", Uuid::new_v4().simple()),
        event_type: event_type.to_string(),
        data,
        metadata: serde_json::json!({ "session_id": session_id.to_string() }),
    }
}

/// Reads a JSON field as a `Decimal`, whether it was serialized as a string
/// or a bare number.
pub fn dec_field(value: &Value) -> rust_decimal::Decimal {
    use std::str::FromStr;
    match value {
        Value::String(s) => rust_decimal::Decimal::from_str(s).expect("decimal field"),
        Value::Number(n) => rust_decimal::Decimal::from_str(&n.to_string()).expect("decimal field"),
        other => panic!("expected a decimal field, got {other}"),
    }
}

/// Minimal valid session-creation payload.
pub fn session_payload(store_id: Uuid, amount: &str) -> Value {
    serde_json::json!({
        "store_id": store_id.to_string(),
        "page_id": Uuid::new_v4().to_string(),
        "amount": amount,
        "currency": "USD",
        "customer_email": "buyer@example.com",
    })
}
