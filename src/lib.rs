//! HostedPay API Library
//!
//! This crate provides the transactional core for a hosted-checkout
//! platform: checkout sessions driven by a pure state machine, payments and
//! attempts, an append-only balance ledger, idempotency bookkeeping, and
//! merchant webhook delivery.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod cache;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod migrator;
pub mod psp;
pub mod services;
pub mod sessions;

use axum::{extract::State, response::Json, routing::get, routing::post, Router};
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::task::JoinHandle;

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<config::AppConfig>,
    pub cache: Arc<dyn cache::CacheBackend>,
    pub psp: Arc<dyn psp::PspClient>,
    pub event_sender: events::EventSender,
    pub services: handlers::AppServices,
}

impl AppState {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: Arc<config::AppConfig>,
        cache: Arc<dyn cache::CacheBackend>,
        psp: Arc<dyn psp::PspClient>,
        event_sender: events::EventSender,
    ) -> Self {
        let services = handlers::AppServices::new(
            db.clone(),
            config.clone(),
            cache.clone(),
            psp.clone(),
            event_sender.clone(),
        );
        Self {
            db,
            config,
            cache,
            psp,
            event_sender,
            services,
        }
    }
}

// Common response wrappers
#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    pub timestamp: String,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// Standard API result type for JSON responses
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, errors::ServiceError>;

// API routes
pub fn api_v1_routes() -> Router<AppState> {
    Router::new()
        // Status and health endpoints
        .route("/status", get(api_status))
        .route("/health", get(health_check))
        // Checkout sessions
        .nest("/checkout", handlers::sessions::routes())
        // Inbound provider callbacks (signature-verified, no auth)
        .route("/psp/webhook", post(handlers::psp_webhooks::psp_webhook))
        // Store balances
        .nest("/stores", handlers::balance::routes())
        // Merchant webhook endpoints and deliveries
        .nest("/webhook-endpoints", handlers::webhook_endpoints::routes())
}

/// Builds the full application router with the `/api/v1` prefix.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", api_v1_routes())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn api_status() -> ApiResult<Value> {
    let status_data = json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "hostedpay-api",
        "timestamp": Utc::now().to_rfc3339(),
    });
    Ok(Json(ApiResponse::success(status_data)))
}

async fn health_check(State(state): State<AppState>) -> ApiResult<Value> {
    let db_status = match state.db.ping().await {
        Ok(_) => "healthy",
        Err(_) => "unhealthy",
    };
    let cache_status = match state.cache.exists("health:probe").await {
        Ok(_) => "healthy",
        Err(_) => "unhealthy",
    };

    let health_data = json!({
        "status": if db_status == "healthy" && cache_status == "healthy" { "healthy" } else { "unhealthy" },
        "checks": {
            "database": db_status,
            "cache": cache_status,
        },
        "timestamp": Utc::now().to_rfc3339(),
    });
    Ok(Json(ApiResponse::success(health_data)))
}

/// Spawns the periodic background loops: webhook dispatcher, session-expiry
/// sweep, and idempotency cleanup. The dispatcher additionally wakes as soon
/// as new deliveries are enqueued.
pub fn spawn_background_tasks(state: &AppState) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    let webhooks = state.services.webhooks.clone();
    let dispatch_interval = std::time::Duration::from_millis(state.config.dispatch_interval_ms);
    handles.push(tokio::spawn(async move {
        let notify = webhooks.notifier();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(dispatch_interval) => {}
                _ = notify.notified() => {}
            }
            if let Err(e) = webhooks.dispatch_due(Utc::now()).await {
                tracing::error!("webhook dispatch pass failed: {}", e);
            }
        }
    }));

    let checkout = state.services.checkout.clone();
    let sweep_interval = std::time::Duration::from_secs(state.config.sweep_interval_secs);
    handles.push(tokio::spawn(async move {
        loop {
            tokio::time::sleep(sweep_interval).await;
            if let Err(e) = checkout.expire_due_sessions(Utc::now()).await {
                tracing::error!("session expiry sweep failed: {}", e);
            }
        }
    }));

    let idempotency = state.services.idempotency.clone();
    handles.push(tokio::spawn(async move {
        loop {
            tokio::time::sleep(sweep_interval).await;
            if let Err(e) = idempotency.cleanup_expired(Utc::now()).await {
                tracing::error!("idempotency cleanup sweep failed: {}", e);
            }
        }
    }));

    handles
}
