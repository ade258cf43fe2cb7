//! In-process domain events.
//!
//! Services emit an [`Event`] after their side effects commit; a background
//! consumer logs the stream. Merchant-facing webhook events are written by
//! the orchestrator through the webhook service at the same commit point —
//! the bus is observability plumbing, not the delivery path.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Session lifecycle
    SessionCreated(Uuid),
    SessionUpdated(Uuid),
    SessionCompleted {
        session_id: Uuid,
        payment_id: Uuid,
        amount: Decimal,
        currency: String,
    },
    SessionExpired(Uuid),
    SessionAbandoned(Uuid),

    // Payment lifecycle
    PaymentInitiated {
        session_id: Uuid,
        payment_id: Uuid,
        attempt_number: i32,
    },
    PaymentRequiresAction {
        session_id: Uuid,
        payment_id: Uuid,
    },
    PaymentSucceeded(Uuid),
    PaymentFailed {
        payment_id: Uuid,
        failure_code: Option<String>,
    },

    // Ledger
    BalanceTransactionRecorded {
        store_id: Uuid,
        transaction_id: Uuid,
        balance_after: Decimal,
        currency: String,
    },

    // Webhook engine
    WebhookEventCreated {
        event_id: Uuid,
        event_type: String,
    },
    WebhookDeliveryExhausted {
        delivery_id: Uuid,
        endpoint_id: Uuid,
    },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event; a full or closed channel is logged, never surfaced.
    /// Event emission must not fail the business operation that produced it.
    pub async fn send(&self, event: Event) {
        if let Err(e) = self.sender.send(event).await {
            warn!("failed to dispatch domain event: {}", e);
        }
    }
}

/// Creates the channel pair used by `AppState`.
pub fn channel(capacity: usize) -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSender::new(tx), rx)
}

/// Background consumer that drains the event stream into the log.
pub fn spawn_event_logger(mut receiver: mpsc::Receiver<Event>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            info!(?event, "domain event");
        }
    })
}
