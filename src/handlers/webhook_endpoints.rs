//! Merchant webhook endpoint management.
//!
//! The signing secret appears in exactly two responses: endpoint creation
//! and secret rotation. Every other representation goes through
//! [`EndpointResponse`], which does not carry the field at all.

use axum::{
    extract::{Path, State},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;
use validator::Validate;

use crate::{
    entities::webhook_endpoint,
    errors::ServiceError,
    handlers::common::{created_response, success_response, validate_input},
    AppState,
};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_endpoint))
        .route("/stores/:store_id", get(list_endpoints))
        .route("/:id", get(get_endpoint))
        .route("/:id/rotate-secret", post(rotate_secret))
        .route("/:id/deliveries", get(list_deliveries))
        .route("/deliveries/:id/resend", post(resend_delivery))
}

#[derive(Debug, Deserialize, Validate)]
struct CreateEndpointRequest {
    store_id: Uuid,
    #[validate(url)]
    url: String,
    event_types: Vec<String>,
}

/// Endpoint representation without the signing secret.
#[derive(Debug, Serialize)]
struct EndpointResponse {
    id: Uuid,
    store_id: Uuid,
    url: String,
    event_types: serde_json::Value,
    active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<webhook_endpoint::Model> for EndpointResponse {
    fn from(m: webhook_endpoint::Model) -> Self {
        Self {
            id: m.id,
            store_id: m.store_id,
            url: m.url,
            event_types: m.event_types,
            active: m.active,
            created_at: m.created_at,
            updated_at: m.updated_at,
        }
    }
}

/// Creation response: the only place besides rotation where the secret is
/// ever returned.
#[derive(Debug, Serialize)]
struct EndpointCreatedResponse {
    #[serde(flatten)]
    endpoint: EndpointResponse,
    secret: String,
}

#[instrument(skip(state, req))]
async fn create_endpoint(
    State(state): State<AppState>,
    Json(req): Json<CreateEndpointRequest>,
) -> Result<Response, ServiceError> {
    validate_input(&req)?;
    let (endpoint, secret) = state
        .services
        .webhooks
        .create_endpoint(req.store_id, req.url, req.event_types)
        .await?;
    Ok(created_response(EndpointCreatedResponse {
        endpoint: endpoint.into(),
        secret,
    }))
}

async fn list_endpoints(
    State(state): State<AppState>,
    Path(store_id): Path<Uuid>,
) -> Result<Response, ServiceError> {
    let endpoints = state.services.webhooks.list_endpoints(store_id).await?;
    let listed: Vec<EndpointResponse> = endpoints.into_iter().map(Into::into).collect();
    Ok(success_response(listed))
}

async fn get_endpoint(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ServiceError> {
    let endpoint = state.services.webhooks.get_endpoint(id).await?;
    Ok(success_response(EndpointResponse::from(endpoint)))
}

#[derive(Debug, Serialize)]
struct RotatedSecretResponse {
    id: Uuid,
    secret: String,
}

#[instrument(skip(state))]
async fn rotate_secret(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ServiceError> {
    let secret = state.services.webhooks.rotate_secret(id).await?;
    Ok(success_response(RotatedSecretResponse { id, secret }))
}

async fn list_deliveries(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ServiceError> {
    let deliveries = state.services.webhooks.list_deliveries(id).await?;
    Ok(success_response(deliveries))
}

#[instrument(skip(state))]
async fn resend_delivery(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ServiceError> {
    let delivery = state.services.webhooks.resend(id).await?;
    Ok(success_response(delivery))
}
