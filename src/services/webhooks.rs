//! Merchant webhook endpoints, events, and the delivery engine.
//!
//! Events are immutable facts written at the same commit point as the state
//! change they describe. Deliveries fan out from an event, one row per
//! subscribed endpoint, and a polling dispatcher drains the due ones. A
//! retry updates its delivery row in place; the row is the full delivery
//! history for one (event, endpoint) pair.

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    entities::{
        webhook_delivery::{self, DeliveryStatus},
        webhook_endpoint, webhook_event, WebhookDelivery, WebhookEndpoint, WebhookEvent,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    psp::sign_payload,
};

/// Rows fetched per dispatcher pass.
const DISPATCH_BATCH: u64 = 50;

/// Stored response bodies are truncated to this many bytes.
const MAX_STORED_BODY: usize = 1024;

#[derive(Clone)]
pub struct WebhookService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
    http: reqwest::Client,
    max_attempts: i32,
    /// Wakes the dispatcher as soon as new deliveries are enqueued instead
    /// of waiting out the poll interval.
    notify: Arc<Notify>,
}

impl WebhookService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: EventSender,
        max_attempts: i32,
        request_timeout: std::time::Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_default();
        Self {
            db,
            event_sender,
            http,
            max_attempts,
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    // ---- endpoints ----

    /// Registers an endpoint. The returned secret is shown exactly once;
    /// reads and lists never include it.
    pub async fn create_endpoint(
        &self,
        store_id: Uuid,
        url: String,
        event_types: Vec<String>,
    ) -> Result<(webhook_endpoint::Model, String), ServiceError> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ServiceError::ValidationError(
                "webhook url must be http(s)".to_string(),
            ));
        }
        let secret = generate_secret();
        let now = Utc::now();
        let endpoint = webhook_endpoint::ActiveModel {
            id: Set(Uuid::new_v4()),
            store_id: Set(store_id),
            url: Set(url),
            secret: Set(secret.clone()),
            event_types: Set(serde_json::json!(event_types)),
            active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await?;
        info!(endpoint_id = %endpoint.id, store_id = %store_id, "webhook endpoint created");
        Ok((endpoint, secret))
    }

    pub async fn list_endpoints(
        &self,
        store_id: Uuid,
    ) -> Result<Vec<webhook_endpoint::Model>, ServiceError> {
        Ok(WebhookEndpoint::find()
            .filter(webhook_endpoint::Column::StoreId.eq(store_id))
            .order_by_asc(webhook_endpoint::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    pub async fn get_endpoint(
        &self,
        endpoint_id: Uuid,
    ) -> Result<webhook_endpoint::Model, ServiceError> {
        WebhookEndpoint::find_by_id(endpoint_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("webhook endpoint {} not found", endpoint_id))
            })
    }

    /// Replaces the endpoint's signing secret. Deliveries in flight were
    /// signed with the old secret; the merchant must cut over promptly.
    pub async fn rotate_secret(&self, endpoint_id: Uuid) -> Result<String, ServiceError> {
        let endpoint = self.get_endpoint(endpoint_id).await?;
        let secret = generate_secret();
        let mut active: webhook_endpoint::ActiveModel = endpoint.into();
        active.secret = Set(secret.clone());
        active.updated_at = Set(Utc::now());
        active.update(&*self.db).await?;
        info!(endpoint_id = %endpoint_id, "webhook endpoint secret rotated");
        Ok(secret)
    }

    pub async fn set_endpoint_active(
        &self,
        endpoint_id: Uuid,
        active: bool,
    ) -> Result<webhook_endpoint::Model, ServiceError> {
        let endpoint = self.get_endpoint(endpoint_id).await?;
        let mut model: webhook_endpoint::ActiveModel = endpoint.into();
        model.active = Set(active);
        model.updated_at = Set(Utc::now());
        Ok(model.update(&*self.db).await?)
    }

    // ---- events and fan-out ----

    /// Records the business fact and enqueues one pending delivery per
    /// active endpoint subscribed to `event_type`.
    pub async fn create_event(
        &self,
        store_id: Uuid,
        event_type: &str,
        resource_type: &str,
        resource_id: &str,
        payload: serde_json::Value,
    ) -> Result<webhook_event::Model, ServiceError> {
        let now = Utc::now();
        let event = webhook_event::ActiveModel {
            id: Set(Uuid::new_v4()),
            store_id: Set(store_id),
            event_type: Set(event_type.to_string()),
            resource_type: Set(resource_type.to_string()),
            resource_id: Set(resource_id.to_string()),
            payload: Set(payload),
            created_at: Set(now),
        }
        .insert(&*self.db)
        .await?;

        let endpoints = WebhookEndpoint::find()
            .filter(webhook_endpoint::Column::StoreId.eq(store_id))
            .filter(webhook_endpoint::Column::Active.eq(true))
            .all(&*self.db)
            .await?;

        let mut enqueued = 0;
        for endpoint in endpoints {
            if !endpoint.subscribed_to(event_type) {
                continue;
            }
            webhook_delivery::ActiveModel {
                id: Set(Uuid::new_v4()),
                event_id: Set(event.id),
                endpoint_id: Set(endpoint.id),
                status: Set(DeliveryStatus::Pending),
                attempt_number: Set(0),
                next_attempt_at: Set(Some(now)),
                response_status: Set(None),
                response_body: Set(None),
                last_error: Set(None),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(&*self.db)
            .await?;
            enqueued += 1;
        }

        debug!(
            event_id = %event.id,
            event_type,
            deliveries = enqueued,
            "webhook event created"
        );
        self.event_sender
            .send(Event::WebhookEventCreated {
                event_id: event.id,
                event_type: event_type.to_string(),
            })
            .await;
        if enqueued > 0 {
            self.notify.notify_one();
        }
        Ok(event)
    }

    // ---- delivery ----

    /// One dispatcher pass: attempts every due delivery. Returns how many
    /// rows were attempted. Idempotent over terminal rows, which are never
    /// selected.
    pub async fn dispatch_due(&self, now: DateTime<Utc>) -> Result<usize, ServiceError> {
        let due = WebhookDelivery::find()
            .filter(
                Condition::any()
                    .add(webhook_delivery::Column::Status.eq(DeliveryStatus::Pending))
                    .add(webhook_delivery::Column::Status.eq(DeliveryStatus::Retrying)),
            )
            .filter(webhook_delivery::Column::NextAttemptAt.lte(now))
            .order_by_asc(webhook_delivery::Column::NextAttemptAt)
            .limit(DISPATCH_BATCH)
            .all(&*self.db)
            .await?;

        let attempted = due.len();
        for delivery in due {
            if let Err(e) = self.attempt_delivery(delivery, now).await {
                warn!("webhook delivery attempt errored: {}", e);
            }
        }
        Ok(attempted)
    }

    async fn attempt_delivery(
        &self,
        delivery: webhook_delivery::Model,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        let event = WebhookEvent::find_by_id(delivery.event_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("webhook event {} not found", delivery.event_id))
            })?;
        let endpoint = self.get_endpoint(delivery.endpoint_id).await?;

        let attempt = delivery.attempt_number + 1;
        let body = serde_json::to_vec(&serde_json::json!({
            "id": event.id,
            "type": event.event_type,
            "created": event.created_at.timestamp(),
            "data": event.payload,
        }))?;
        // Same t=<ts>,v1=<hex> scheme we verify on inbound provider callbacks.
        let signature = sign_payload(&endpoint.secret, now.timestamp(), &body);

        let result = self
            .http
            .post(&endpoint.url)
            .header("content-type", "application/json")
            .header("webhook-id", event.id.to_string())
            .header("webhook-timestamp", now.timestamp().to_string())
            .header("webhook-signature", signature)
            .body(body)
            .send()
            .await;

        let mut active: webhook_delivery::ActiveModel = delivery.clone().into();
        active.attempt_number = Set(attempt);
        active.updated_at = Set(Utc::now());

        match result {
            Ok(response) if response.status().is_success() => {
                let status = response.status().as_u16() as i32;
                let text = response.text().await.unwrap_or_default();
                active.status = Set(DeliveryStatus::Delivered);
                active.response_status = Set(Some(status));
                active.response_body = Set(Some(truncate_body(&text)));
                active.next_attempt_at = Set(None);
                active.last_error = Set(None);
                active.update(&*self.db).await?;
                info!(
                    delivery_id = %delivery.id,
                    endpoint_id = %endpoint.id,
                    attempt,
                    "webhook delivered"
                );
            }
            Ok(response) => {
                let status = response.status().as_u16() as i32;
                let text = response.text().await.unwrap_or_default();
                self.record_failure(
                    active,
                    &delivery,
                    attempt,
                    now,
                    Some(status),
                    Some(truncate_body(&text)),
                    format!("endpoint returned status {}", status),
                )
                .await?;
            }
            Err(e) => {
                self.record_failure(
                    active,
                    &delivery,
                    attempt,
                    now,
                    None,
                    None,
                    format!("request failed: {}", e),
                )
                .await?;
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_failure(
        &self,
        mut active: webhook_delivery::ActiveModel,
        delivery: &webhook_delivery::Model,
        attempt: i32,
        now: DateTime<Utc>,
        response_status: Option<i32>,
        response_body: Option<String>,
        error: String,
    ) -> Result<(), ServiceError> {
        active.response_status = Set(response_status);
        active.response_body = Set(response_body);
        active.last_error = Set(Some(error.clone()));

        if attempt >= self.max_attempts {
            active.status = Set(DeliveryStatus::Failed);
            active.next_attempt_at = Set(None);
            active.update(&*self.db).await?;
            warn!(
                delivery_id = %delivery.id,
                endpoint_id = %delivery.endpoint_id,
                attempt,
                "webhook delivery exhausted: {}", error
            );
            self.event_sender
                .send(Event::WebhookDeliveryExhausted {
                    delivery_id: delivery.id,
                    endpoint_id: delivery.endpoint_id,
                })
                .await;
        } else {
            let delay = retry_backoff(attempt);
            active.status = Set(DeliveryStatus::Retrying);
            active.next_attempt_at = Set(Some(now + delay));
            active.update(&*self.db).await?;
            debug!(
                delivery_id = %delivery.id,
                attempt,
                retry_in_secs = delay.num_seconds(),
                "webhook delivery will retry: {}", error
            );
        }
        Ok(())
    }

    /// Re-enqueues a delivery for an immediate attempt, regardless of its
    /// current status. The next dispatch pass bumps the attempt counter.
    pub async fn resend(&self, delivery_id: Uuid) -> Result<webhook_delivery::Model, ServiceError> {
        let delivery = WebhookDelivery::find_by_id(delivery_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("webhook delivery {} not found", delivery_id))
            })?;

        let mut active: webhook_delivery::ActiveModel = delivery.into();
        active.status = Set(DeliveryStatus::Pending);
        active.next_attempt_at = Set(Some(Utc::now()));
        active.updated_at = Set(Utc::now());
        let updated = active.update(&*self.db).await?;
        self.notify.notify_one();
        Ok(updated)
    }

    pub async fn list_deliveries(
        &self,
        endpoint_id: Uuid,
    ) -> Result<Vec<webhook_delivery::Model>, ServiceError> {
        Ok(WebhookDelivery::find()
            .filter(webhook_delivery::Column::EndpointId.eq(endpoint_id))
            .order_by_desc(webhook_delivery::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }
}

/// Exponential backoff after the nth failed attempt: 1, 2, 4, 8, 16 minutes.
fn retry_backoff(attempt: i32) -> Duration {
    let exponent = (attempt - 1).clamp(0, 10) as u32;
    Duration::minutes(1 << exponent)
}

fn truncate_body(text: &str) -> String {
    if text.len() <= MAX_STORED_BODY {
        return text.to_string();
    }
    // Cut on a char boundary at or below the cap.
    let mut end = MAX_STORED_BODY;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

fn generate_secret() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("whsec_{}", hex::encode(bytes))
}
