//! Checkout session endpoints.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tracing::instrument;
use uuid::Uuid;

use crate::{
    errors::ServiceError,
    handlers::common::{created_response, success_response},
    services::checkout::CreateSessionRequest,
    services::idempotency::IdempotencyOutcome,
    sessions::machine::SessionUpdate,
    AppState,
};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sessions", post(create_session))
        .route("/sessions/:id", get(get_session).patch(update_session))
        .route("/sessions/:id/initiate-payment", post(initiate_payment))
        .route("/sessions/:id/abandon", post(abandon_session))
}

#[instrument(skip(state, req))]
async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Response, ServiceError> {
    let view = state.services.checkout.create_session(req).await?;
    Ok(created_response(view))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ServiceError> {
    let view = state.services.checkout.get_session(id).await?;
    Ok(success_response(view))
}

#[instrument(skip(state, update))]
async fn update_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(update): Json<SessionUpdate>,
) -> Result<Response, ServiceError> {
    let view = state.services.checkout.update_session(id, update).await?;
    Ok(success_response(view))
}

/// Initiates payment for a session. Honors the `Idempotency-Key` header:
/// replays return the originally stored response, a key reused with a
/// different target is a conflict, and a key still executing is rejected.
#[instrument(skip(state, headers))]
async fn initiate_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Response, ServiceError> {
    let key = headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty());

    let Some(key) = key else {
        let view = state.services.checkout.initiate_payment(id).await?;
        return Ok(success_response(view));
    };

    // The request carries no body; the target session is what the key
    // protects against double execution.
    let request_body = serde_json::json!({ "session_id": id.to_string() });
    let session = state.services.checkout.get_session(id).await?;

    match state
        .services
        .idempotency
        .check_or_create(key, session.store_id, "initiate-payment", &request_body)
        .await?
    {
        IdempotencyOutcome::Replay { status, body } => {
            let status = u16::try_from(status)
                .ok()
                .and_then(|s| StatusCode::from_u16(s).ok())
                .unwrap_or(StatusCode::OK);
            Ok((status, Json(body)).into_response())
        }
        IdempotencyOutcome::InProgress => Err(ServiceError::RequestInProgress),
        IdempotencyOutcome::New => {
            match state.services.checkout.initiate_payment(id).await {
                Ok(view) => {
                    let body = serde_json::to_value(&view)?;
                    let response = success_response(view);
                    state
                        .services
                        .idempotency
                        .set_response(key, i32::from(response.status().as_u16()), body)
                        .await?;
                    Ok(response)
                }
                Err(e) => {
                    // No replayable response was produced; free the key so
                    // the client may retry.
                    state.services.idempotency.release(key).await;
                    Err(e)
                }
            }
        }
    }
}

#[instrument(skip(state))]
async fn abandon_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ServiceError> {
    let view = state.services.checkout.abandon_session(id).await?;
    Ok(success_response(view))
}
