//! Payment-service-provider adapter.
//!
//! The core consumes a narrow capability: create an intent, create a refund,
//! and parse a signed webhook callback. Everything provider-specific stays
//! behind [`PspClient`]. `MockPsp` is the in-tree implementation used by
//! tests and local development.

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::VecDeque;
use std::sync::Mutex;
use uuid::Uuid;

use crate::errors::ServiceError;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Processing,
    RequiresAction,
    Succeeded,
    Failed,
}

/// Result of creating a payment intent on the provider.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub client_secret: String,
    pub status: IntentStatus,
    pub requires_action: bool,
    pub next_action_url: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PspRefund {
    pub id: String,
    pub status: String,
}

/// Parsed, signature-verified provider callback.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PspEvent {
    pub id: String,
    pub event_type: String,
    pub data: serde_json::Value,
    /// Metadata echoed back from intent creation; carries our session id.
    pub metadata: serde_json::Value,
}

impl PspEvent {
    pub fn session_id(&self) -> Option<Uuid> {
        self.metadata
            .get("session_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    pub fn amount(&self) -> Option<Decimal> {
        use std::str::FromStr;
        match self.data.get("amount") {
            Some(serde_json::Value::String(s)) => Decimal::from_str(s).ok(),
            Some(v) => v.as_f64().and_then(Decimal::from_f64_retain),
            None => None,
        }
    }
}

#[async_trait]
pub trait PspClient: Send + Sync {
    async fn create_payment_intent(
        &self,
        amount: Decimal,
        currency: &str,
        metadata: serde_json::Value,
    ) -> Result<PaymentIntent, ServiceError>;

    async fn create_refund(
        &self,
        intent_id: &str,
        amount: Option<Decimal>,
    ) -> Result<PspRefund, ServiceError>;

    /// Verifies the signature header and parses the raw callback body.
    fn construct_webhook_event(
        &self,
        raw_body: &[u8],
        signature_header: &str,
    ) -> Result<PspEvent, ServiceError>;
}

/// Computes the `t=<ts>,v1=<hex>` signature header for `payload` at `ts`.
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(format!("{}.", timestamp).as_bytes());
    mac.update(payload);
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}

/// Verifies a `t=<ts>,v1=<hex>` header against `payload` with a clock-skew
/// tolerance. Comparison is constant-time.
pub fn verify_signature(
    secret: &str,
    signature_header: &str,
    payload: &[u8],
    tolerance_secs: u64,
) -> bool {
    let mut ts = "";
    let mut v1 = "";
    for part in signature_header.split(',') {
        let mut it = part.trim().splitn(2, '=');
        match (it.next(), it.next()) {
            (Some("t"), Some(val)) => ts = val,
            (Some("v1"), Some(val)) => v1 = val,
            _ => {}
        }
    }
    if ts.is_empty() || v1.is_empty() {
        return false;
    }
    let Ok(ts_i) = ts.parse::<i64>() else {
        return false;
    };
    if (Utc::now().timestamp() - ts_i).unsigned_abs() > tolerance_secs {
        return false;
    }

    let expected = sign_payload(secret, ts_i, payload);
    let expected_v1 = expected.rsplit("v1=").next().unwrap_or("");
    constant_time_eq(expected_v1, v1)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}

/// Scripted outcome for the next `create_payment_intent` call on `MockPsp`.
#[derive(Clone, Debug)]
pub enum MockIntentOutcome {
    Succeed,
    RequireAction { redirect_url: String },
    Fail { code: String, message: String },
    Error(String),
}

/// In-tree provider used by tests and local development. Intent creation
/// pops scripted outcomes (defaulting to `Succeed`); webhook construction
/// verifies real HMAC signatures with the mock's secret.
pub struct MockPsp {
    secret: String,
    tolerance_secs: u64,
    script: Mutex<VecDeque<MockIntentOutcome>>,
}

impl MockPsp {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs: 300,
            script: Mutex::new(VecDeque::new()),
        }
    }

    pub fn enqueue(&self, outcome: MockIntentOutcome) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Builds a signed callback body + header pair, as the provider would.
    pub fn signed_event(&self, event: &PspEvent) -> (Vec<u8>, String) {
        let body = serde_json::to_vec(event).expect("event serializes");
        let header = sign_payload(&self.secret, Utc::now().timestamp(), &body);
        (body, header)
    }
}

#[async_trait]
impl PspClient for MockPsp {
    async fn create_payment_intent(
        &self,
        _amount: Decimal,
        _currency: &str,
        _metadata: serde_json::Value,
    ) -> Result<PaymentIntent, ServiceError> {
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(MockIntentOutcome::Succeed);

        let id = format!("pi_mock_{}", Uuid::new_v4().simple());
        let client_secret = format!("{}_secret_{}", id, Uuid::new_v4().simple());

        match outcome {
            MockIntentOutcome::Succeed => Ok(PaymentIntent {
                id,
                client_secret,
                status: IntentStatus::Processing,
                requires_action: false,
                next_action_url: None,
            }),
            MockIntentOutcome::RequireAction { redirect_url } => Ok(PaymentIntent {
                id,
                client_secret,
                status: IntentStatus::RequiresAction,
                requires_action: true,
                next_action_url: Some(redirect_url),
            }),
            MockIntentOutcome::Fail { code, message } => {
                Err(ServiceError::PaymentFailed(format!("{}: {}", code, message)))
            }
            MockIntentOutcome::Error(message) => Err(ServiceError::ProviderError(message)),
        }
    }

    async fn create_refund(
        &self,
        intent_id: &str,
        _amount: Option<Decimal>,
    ) -> Result<PspRefund, ServiceError> {
        Ok(PspRefund {
            id: format!("re_mock_{}", Uuid::new_v4().simple()),
            status: format!("refunded:{}", intent_id),
        })
    }

    fn construct_webhook_event(
        &self,
        raw_body: &[u8],
        signature_header: &str,
    ) -> Result<PspEvent, ServiceError> {
        if !verify_signature(&self.secret, signature_header, raw_body, self.tolerance_secs) {
            return Err(ServiceError::Unauthorized(
                "invalid webhook signature".to_string(),
            ));
        }
        serde_json::from_slice(raw_body)
            .map_err(|e| ServiceError::BadRequest(format!("invalid webhook payload: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn signature_roundtrip_verifies() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = sign_payload("whsec_test", Utc::now().timestamp(), payload);
        assert!(verify_signature("whsec_test", &header, payload, 300));
        assert!(!verify_signature("whsec_other", &header, payload, 300));
    }

    #[test]
    fn stale_timestamps_are_rejected() {
        let payload = b"{}";
        let header = sign_payload("whsec_test", Utc::now().timestamp() - 1_000, payload);
        assert!(!verify_signature("whsec_test", &header, payload, 300));
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let header = sign_payload("whsec_test", Utc::now().timestamp(), b"original");
        assert!(!verify_signature("whsec_test", &header, b"tampered", 300));
    }

    #[tokio::test]
    async fn mock_pops_scripted_outcomes_in_order() {
        let psp = MockPsp::new("whsec_test");
        psp.enqueue(MockIntentOutcome::RequireAction {
            redirect_url: "https://psp.example/3ds".into(),
        });

        let first = psp
            .create_payment_intent(dec!(10), "USD", serde_json::json!({}))
            .await
            .unwrap();
        assert!(first.requires_action);

        // Script exhausted: defaults to Succeed
        let second = psp
            .create_payment_intent(dec!(10), "USD", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(second.status, IntentStatus::Processing);
    }

    #[test]
    fn constructed_event_exposes_session_metadata() {
        let psp = MockPsp::new("whsec_test");
        let session_id = Uuid::new_v4();
        let event = PspEvent {
            id: "evt_1".into(),
            event_type: "payment.succeeded".into(),
            data: serde_json::json!({"amount": "99.99"}),
            metadata: serde_json::json!({"session_id": session_id.to_string()}),
        };
        let (body, header) = psp.signed_event(&event);
        let parsed = psp.construct_webhook_event(&body, &header).unwrap();
        assert_eq!(parsed.session_id(), Some(session_id));
        assert_eq!(parsed.amount(), Some(dec!(99.99)));
    }
}
