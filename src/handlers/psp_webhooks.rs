//! Inbound payment-provider webhook.
//!
//! The provider is the source of truth for payment outcomes; this endpoint
//! verifies the callback signature, deduplicates by provider event id, and
//! feeds the outcome into the session orchestrator. Unknown or out-of-order
//! events are acknowledged without effect so the provider stops retrying.

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::{errors::ServiceError, psp::PspEvent, AppState};

/// Provider event ids are remembered this long for deduplication.
const EVENT_DEDUPE_TTL: Duration = Duration::from_secs(24 * 3600);

#[instrument(skip(state, headers, body))]
pub async fn psp_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServiceError> {
    let signature = headers
        .get("psp-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ServiceError::Unauthorized("missing psp-signature header".to_string()))?;

    let event = state.psp.construct_webhook_event(&body, signature)?;

    // Providers redeliver; the first arrival wins and replays are no-ops.
    let dedupe_key = format!("psp:event:{}", event.id);
    match state.cache.set_nx(&dedupe_key, "1", EVENT_DEDUPE_TTL).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(event_id = %event.id, "duplicate provider event ignored");
            return Ok(acknowledge());
        }
        Err(e) => {
            // Dedupe is best-effort; the orchestrator is idempotent over
            // terminal sessions anyway.
            warn!("provider event dedupe unavailable: {}", e);
        }
    }

    route_event(&state, &event).await?;
    Ok(acknowledge())
}

async fn route_event(state: &AppState, event: &PspEvent) -> Result<(), ServiceError> {
    let Some(session_id) = event.session_id() else {
        warn!(
            event_id = %event.id,
            event_type = %event.event_type,
            "provider event without session metadata ignored"
        );
        return Ok(());
    };

    info!(
        event_id = %event.id,
        event_type = %event.event_type,
        session_id = %session_id,
        "processing provider event"
    );

    let checkout = &state.services.checkout;
    match event.event_type.as_str() {
        "payment.succeeded" => {
            let amount = event.amount().ok_or_else(|| {
                ServiceError::BadRequest("settlement event is missing an amount".to_string())
            })?;
            checkout.handle_payment_succeeded(session_id, amount).await
        }
        "payment.failed" => {
            let code = event
                .data
                .get("failure_code")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            let message = event
                .data
                .get("failure_message")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            checkout.handle_payment_failed(session_id, code, message).await
        }
        "payment.requires_action" => {
            let redirect_url = event
                .data
                .get("redirect_url")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            checkout.handle_requires_action(session_id, redirect_url).await
        }
        "payment.action_completed" => checkout.handle_action_completed(session_id).await,
        "payment.action_failed" => checkout.handle_action_failed(session_id).await,
        other => {
            debug!(event_type = other, "unhandled provider event type");
            Ok(())
        }
    }
}

fn acknowledge() -> Response {
    Json(json!({ "received": true })).into_response()
}
