//! Pure checkout-session state machine.
//!
//! `transition` is a function of `(state, context, event, now)` with no I/O.
//! All side effects (persistence, PSP calls, ledger writes, webhook enqueue)
//! live in the orchestrator, which applies them after a transition has been
//! computed. The caller supplies `now` so expiry checks stay deterministic
//! under test.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::checkout_session::SessionStatus;

/// Attempt ceiling per session.
pub const MAX_ATTEMPTS: usize = 3;

/// Tolerance when comparing the provider-reported settled amount against the
/// session amount. Mismatches beyond this are a data-integrity signal.
pub const AMOUNT_TOLERANCE: Decimal = dec!(0.01);

/// Failure codes that never warrant another attempt.
const NON_RETRYABLE_FAILURE_CODES: &[&str] = &[
    "fraudulent",
    "stolen_card",
    "lost_card",
    "pickup_card",
    "restricted_card",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Open,
    Processing,
    AwaitingAction,
    Completed,
    Expired,
    Abandoned,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Expired | SessionState::Abandoned
        )
    }

    pub fn as_status(&self) -> SessionStatus {
        match self {
            SessionState::Open => SessionStatus::Open,
            SessionState::Processing => SessionStatus::Processing,
            SessionState::AwaitingAction => SessionStatus::AwaitingAction,
            SessionState::Completed => SessionStatus::Completed,
            SessionState::Expired => SessionStatus::Expired,
            SessionState::Abandoned => SessionStatus::Abandoned,
        }
    }

    pub fn from_status(status: SessionStatus) -> Self {
        match status {
            SessionStatus::Open => SessionState::Open,
            SessionStatus::Processing => SessionState::Processing,
            SessionStatus::AwaitingAction => SessionState::AwaitingAction,
            SessionStatus::Completed => SessionState::Completed,
            SessionStatus::Expired => SessionState::Expired,
            SessionStatus::Abandoned => SessionState::Abandoned,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Pending,
    RequiresAction,
    Succeeded,
    Failed,
}

/// One payment attempt as the machine sees it. Mirrors a `payment_attempts`
/// row and is reconciled back into one by the persistence adapter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub sequence: i32,
    pub outcome: AttemptOutcome,
    pub requires_action: bool,
    pub redirect_url: Option<String>,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
}

/// The state machine's working memory. Logically part of the session; the
/// only mutable-in-place structure in the core.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: Uuid,
    pub store_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub customer_id: Option<Uuid>,
    pub customer_email: Option<String>,
    pub allow_custom_amount: bool,
    pub variant_choices: Option<serde_json::Value>,
    pub coupon_id: Option<Uuid>,
    pub discount_amount: Decimal,
    pub expires_at: DateTime<Utc>,
    pub attempts: Vec<AttemptRecord>,
    pub last_error: Option<String>,
    pub redirect_url: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub abandoned_at: Option<DateTime<Utc>>,
}

/// Fields a client update may merge into an open session.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SessionUpdate {
    pub amount: Option<Decimal>,
    pub customer_id: Option<Uuid>,
    pub customer_email: Option<String>,
    pub variant_choices: Option<serde_json::Value>,
    pub coupon_id: Option<Uuid>,
    pub discount_amount: Option<Decimal>,
}

#[derive(Clone, Debug)]
pub enum SessionEvent {
    UpdateSession(SessionUpdate),
    InitiatePayment,
    PaymentSucceeded { amount: Decimal },
    PaymentFailed { code: Option<String>, message: Option<String> },
    RequiresAction { redirect_url: String },
    ActionCompleted,
    ActionFailed,
    Timeout,
    Abandon,
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::UpdateSession(_) => "UPDATE_SESSION",
            SessionEvent::InitiatePayment => "INITIATE_PAYMENT",
            SessionEvent::PaymentSucceeded { .. } => "PAYMENT_SUCCEEDED",
            SessionEvent::PaymentFailed { .. } => "PAYMENT_FAILED",
            SessionEvent::RequiresAction { .. } => "REQUIRES_ACTION",
            SessionEvent::ActionCompleted => "ACTION_COMPLETED",
            SessionEvent::ActionFailed => "ACTION_FAILED",
            SessionEvent::Timeout => "TIMEOUT",
            SessionEvent::Abandon => "ABANDON",
        }
    }
}

/// Result of applying one event.
#[derive(Clone, Debug)]
pub struct Transition {
    pub state: SessionState,
    pub context: SessionContext,
    /// False when the event was ignored (wrong state, terminal state) or a
    /// guard kept the machine in place with a recorded error.
    pub changed_state: bool,
}

impl SessionContext {
    pub fn has_customer_identity(&self) -> bool {
        self.customer_id.is_some()
            || self
                .customer_email
                .as_deref()
                .map(|e| !e.trim().is_empty())
                .unwrap_or(false)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn next_sequence(&self) -> i32 {
        self.attempts.last().map(|a| a.sequence + 1).unwrap_or(1)
    }

    /// Marks the in-flight attempt failed, or appends a failed record when
    /// no attempt is in flight (out-of-band failure callbacks).
    fn record_failed_attempt(&mut self, code: Option<String>, message: Option<String>) {
        if let Some(last) = self.attempts.last_mut() {
            if matches!(
                last.outcome,
                AttemptOutcome::Pending | AttemptOutcome::RequiresAction
            ) {
                last.outcome = AttemptOutcome::Failed;
                last.requires_action = false;
                last.redirect_url = None;
                last.failure_code = code;
                last.failure_message = message;
                return;
            }
        }
        let sequence = self.next_sequence();
        self.attempts.push(AttemptRecord {
            sequence,
            outcome: AttemptOutcome::Failed,
            requires_action: false,
            redirect_url: None,
            failure_code: code,
            failure_message: message,
        });
    }
}

/// Guard: may a payment be initiated right now?
pub fn is_valid_for_payment(ctx: &SessionContext, now: DateTime<Utc>) -> Result<(), String> {
    if !ctx.has_customer_identity() {
        return Err("customer email or id is required before payment".to_string());
    }
    if ctx.amount <= Decimal::ZERO {
        return Err("amount must be greater than zero".to_string());
    }
    if ctx.is_expired(now) {
        return Err("session has expired".to_string());
    }
    Ok(())
}

/// Guard: does the provider-reported amount match the session amount?
pub fn is_amount_valid(expected: Decimal, reported: Decimal) -> bool {
    (expected - reported).abs() <= AMOUNT_TOLERANCE
}

/// Guard: is another attempt allowed after a failure?
pub fn can_retry(ctx: &SessionContext, now: DateTime<Utc>) -> bool {
    if ctx.attempts.len() >= MAX_ATTEMPTS {
        return false;
    }
    if ctx.is_expired(now) {
        return false;
    }
    let last_code = ctx
        .attempts
        .last()
        .and_then(|a| a.failure_code.as_deref())
        .unwrap_or("");
    !NON_RETRYABLE_FAILURE_CODES.contains(&last_code)
}

/// Applies `event` to `(state, context)` at time `now`.
///
/// Terminal states absorb every event unchanged. Unknown (state, event)
/// pairings are ignored rather than treated as errors: out-of-order provider
/// callbacks are expected and must not corrupt the session.
pub fn transition(
    state: SessionState,
    mut ctx: SessionContext,
    event: &SessionEvent,
    now: DateTime<Utc>,
) -> Transition {
    if state.is_terminal() {
        return Transition { state, context: ctx, changed_state: false };
    }

    match (state, event) {
        (SessionState::Open, SessionEvent::UpdateSession(update)) => {
            // Amount is fixed once set, except pay-what-you-want flows prior
            // to any payment attempt.
            if let Some(amount) = update.amount {
                if ctx.allow_custom_amount && ctx.attempts.is_empty() {
                    ctx.amount = amount;
                }
            }
            if let Some(customer_id) = update.customer_id {
                ctx.customer_id = Some(customer_id);
            }
            if let Some(email) = &update.customer_email {
                ctx.customer_email = Some(email.clone());
            }
            if let Some(choices) = &update.variant_choices {
                ctx.variant_choices = Some(choices.clone());
            }
            if let Some(coupon_id) = update.coupon_id {
                ctx.coupon_id = Some(coupon_id);
            }
            if let Some(discount) = update.discount_amount {
                ctx.discount_amount = discount;
            }
            ctx.last_error = None;
            Transition { state: SessionState::Open, context: ctx, changed_state: false }
        }

        (SessionState::Open, SessionEvent::InitiatePayment) => {
            match is_valid_for_payment(&ctx, now) {
                Ok(()) => {
                    ctx.last_error = None;
                    Transition {
                        state: SessionState::Processing,
                        context: ctx,
                        changed_state: true,
                    }
                }
                Err(reason) => {
                    // Validation failure is not a retriable attempt.
                    ctx.last_error = Some(reason);
                    Transition { state: SessionState::Open, context: ctx, changed_state: false }
                }
            }
        }

        (SessionState::Open | SessionState::AwaitingAction, SessionEvent::Timeout) => {
            if ctx.is_expired(now) {
                Transition { state: SessionState::Expired, context: ctx, changed_state: true }
            } else {
                Transition { state, context: ctx, changed_state: false }
            }
        }

        (SessionState::Open, SessionEvent::Abandon) => {
            ctx.abandoned_at = Some(now);
            Transition { state: SessionState::Abandoned, context: ctx, changed_state: true }
        }

        (SessionState::Processing, SessionEvent::PaymentSucceeded { amount }) => {
            if is_amount_valid(ctx.amount, *amount) {
                if let Some(last) = ctx.attempts.last_mut() {
                    last.outcome = AttemptOutcome::Succeeded;
                }
                ctx.redirect_url = None;
                ctx.last_error = None;
                ctx.completed_at = Some(now);
                Transition { state: SessionState::Completed, context: ctx, changed_state: true }
            } else {
                ctx.last_error = Some(format!(
                    "amount mismatch: session expected {}, provider reported {}",
                    ctx.amount, amount
                ));
                Transition { state: SessionState::Open, context: ctx, changed_state: true }
            }
        }

        (SessionState::Processing, SessionEvent::PaymentFailed { code, message }) => {
            ctx.record_failed_attempt(code.clone(), message.clone());
            ctx.redirect_url = None;
            fail_or_retire(ctx, now)
        }

        (SessionState::Processing, SessionEvent::RequiresAction { redirect_url }) => {
            if let Some(last) = ctx.attempts.last_mut() {
                last.outcome = AttemptOutcome::RequiresAction;
                last.requires_action = true;
                last.redirect_url = Some(redirect_url.clone());
            }
            ctx.redirect_url = Some(redirect_url.clone());
            Transition {
                state: SessionState::AwaitingAction,
                context: ctx,
                changed_state: true,
            }
        }

        (SessionState::AwaitingAction, SessionEvent::ActionCompleted) => {
            ctx.redirect_url = None;
            Transition { state: SessionState::Processing, context: ctx, changed_state: true }
        }

        (SessionState::AwaitingAction, SessionEvent::ActionFailed) => {
            ctx.record_failed_attempt(
                Some("action_failed".to_string()),
                Some("customer authentication failed".to_string()),
            );
            ctx.redirect_url = None;
            fail_or_retire(ctx, now)
        }

        // Out-of-order or irrelevant event for this state.
        _ => Transition { state, context: ctx, changed_state: false },
    }
}

fn fail_or_retire(mut ctx: SessionContext, now: DateTime<Utc>) -> Transition {
    if can_retry(&ctx, now) {
        let last = ctx.attempts.last();
        ctx.last_error = last.and_then(|a| {
            a.failure_message
                .clone()
                .or_else(|| a.failure_code.clone())
        });
        Transition { state: SessionState::Open, context: ctx, changed_state: true }
    } else {
        Transition { state: SessionState::Expired, context: ctx, changed_state: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ctx(amount: Decimal) -> SessionContext {
        SessionContext {
            session_id: Uuid::new_v4(),
            store_id: Uuid::new_v4(),
            amount,
            currency: "USD".to_string(),
            customer_id: None,
            customer_email: Some("shopper@example.com".to_string()),
            allow_custom_amount: false,
            variant_choices: None,
            coupon_id: None,
            discount_amount: Decimal::ZERO,
            expires_at: Utc::now() + Duration::hours(1),
            attempts: Vec::new(),
            last_error: None,
            redirect_url: None,
            completed_at: None,
            abandoned_at: None,
        }
    }

    fn failed_attempt(sequence: i32, code: &str) -> AttemptRecord {
        AttemptRecord {
            sequence,
            outcome: AttemptOutcome::Failed,
            requires_action: false,
            redirect_url: None,
            failure_code: Some(code.to_string()),
            failure_message: None,
        }
    }

    #[test]
    fn initiate_payment_enters_processing() {
        let now = Utc::now();
        let t = transition(SessionState::Open, ctx(dec!(99.99)), &SessionEvent::InitiatePayment, now);
        assert_eq!(t.state, SessionState::Processing);
        assert!(t.changed_state);
    }

    #[test]
    fn initiate_payment_without_customer_records_validation_error() {
        let now = Utc::now();
        let mut c = ctx(dec!(50));
        c.customer_email = None;
        let t = transition(SessionState::Open, c, &SessionEvent::InitiatePayment, now);
        assert_eq!(t.state, SessionState::Open);
        assert!(!t.changed_state);
        assert!(t.context.last_error.as_deref().unwrap().contains("customer"));
        // Not counted as a retriable failure
        assert!(t.context.attempts.is_empty());
    }

    #[test]
    fn initiate_payment_rejects_non_positive_amount() {
        let now = Utc::now();
        let t = transition(SessionState::Open, ctx(Decimal::ZERO), &SessionEvent::InitiatePayment, now);
        assert_eq!(t.state, SessionState::Open);
        assert!(t.context.last_error.is_some());
    }

    #[test]
    fn initiate_payment_rejects_expired_session() {
        let now = Utc::now();
        let mut c = ctx(dec!(10));
        c.expires_at = now - Duration::minutes(1);
        let t = transition(SessionState::Open, c, &SessionEvent::InitiatePayment, now);
        assert_eq!(t.state, SessionState::Open);
        assert!(t.context.last_error.as_deref().unwrap().contains("expired"));
    }

    #[test]
    fn amount_within_tolerance_completes() {
        assert!(is_amount_valid(dec!(100.00), dec!(100.005)));
        assert!(!is_amount_valid(dec!(100.00), dec!(100.02)));

        let now = Utc::now();
        let t = transition(
            SessionState::Processing,
            ctx(dec!(100.00)),
            &SessionEvent::PaymentSucceeded { amount: dec!(100.005) },
            now,
        );
        assert_eq!(t.state, SessionState::Completed);
        assert!(t.context.completed_at.is_some());
    }

    #[test]
    fn amount_mismatch_returns_to_open_with_error() {
        let now = Utc::now();
        let t = transition(
            SessionState::Processing,
            ctx(dec!(100.00)),
            &SessionEvent::PaymentSucceeded { amount: dec!(100.02) },
            now,
        );
        assert_eq!(t.state, SessionState::Open);
        assert!(t.context.last_error.as_deref().unwrap().contains("mismatch"));
    }

    #[test]
    fn payment_failure_returns_to_open_when_retryable() {
        let now = Utc::now();
        let t = transition(
            SessionState::Processing,
            ctx(dec!(25)),
            &SessionEvent::PaymentFailed {
                code: Some("card_declined".to_string()),
                message: Some("insufficient funds".to_string()),
            },
            now,
        );
        assert_eq!(t.state, SessionState::Open);
        assert_eq!(t.context.attempts.len(), 1);
        assert_eq!(t.context.last_error.as_deref(), Some("insufficient funds"));
    }

    #[test]
    fn can_retry_false_at_attempt_ceiling() {
        let now = Utc::now();
        let mut c = ctx(dec!(25));
        c.attempts = vec![
            failed_attempt(1, "card_declined"),
            failed_attempt(2, "card_declined"),
            failed_attempt(3, "card_declined"),
        ];
        assert!(!can_retry(&c, now));
    }

    #[test]
    fn can_retry_false_after_expiry() {
        let now = Utc::now();
        let mut c = ctx(dec!(25));
        c.attempts = vec![failed_attempt(1, "card_declined")];
        c.expires_at = now - Duration::seconds(1);
        assert!(!can_retry(&c, now));
    }

    #[test]
    fn can_retry_false_for_non_retryable_codes() {
        let now = Utc::now();
        for code in ["fraudulent", "stolen_card", "lost_card"] {
            let mut c = ctx(dec!(25));
            c.attempts = vec![failed_attempt(1, code)];
            assert!(!can_retry(&c, now), "{code} should not be retryable");
        }
    }

    #[test]
    fn third_failure_expires_session() {
        let now = Utc::now();
        let mut c = ctx(dec!(25));
        c.attempts = vec![
            failed_attempt(1, "card_declined"),
            failed_attempt(2, "card_declined"),
        ];
        let t = transition(
            SessionState::Processing,
            c,
            &SessionEvent::PaymentFailed {
                code: Some("card_declined".to_string()),
                message: None,
            },
            now,
        );
        assert_eq!(t.state, SessionState::Expired);
        assert_eq!(t.context.attempts.len(), 3);
    }

    #[test]
    fn fraudulent_failure_expires_immediately() {
        let now = Utc::now();
        let t = transition(
            SessionState::Processing,
            ctx(dec!(25)),
            &SessionEvent::PaymentFailed {
                code: Some("fraudulent".to_string()),
                message: None,
            },
            now,
        );
        assert_eq!(t.state, SessionState::Expired);
    }

    #[test]
    fn requires_action_stores_redirect_and_action_completed_clears_it() {
        let now = Utc::now();
        let url = "https://psp.example/3ds/abc".to_string();
        let t = transition(
            SessionState::Processing,
            ctx(dec!(42)),
            &SessionEvent::RequiresAction { redirect_url: url.clone() },
            now,
        );
        assert_eq!(t.state, SessionState::AwaitingAction);
        assert_eq!(t.context.redirect_url.as_deref(), Some(url.as_str()));

        let t2 = transition(t.state, t.context, &SessionEvent::ActionCompleted, now);
        assert_eq!(t2.state, SessionState::Processing);
        assert_eq!(t2.context.redirect_url, None);
    }

    #[test]
    fn action_failed_appends_attempt_with_action_failed_code() {
        let now = Utc::now();
        let t = transition(SessionState::AwaitingAction, ctx(dec!(42)), &SessionEvent::ActionFailed, now);
        assert_eq!(t.state, SessionState::Open);
        assert_eq!(
            t.context.attempts.last().unwrap().failure_code.as_deref(),
            Some("action_failed")
        );
    }

    #[test]
    fn timeout_only_fires_past_expiry() {
        let now = Utc::now();
        let live = transition(SessionState::Open, ctx(dec!(10)), &SessionEvent::Timeout, now);
        assert_eq!(live.state, SessionState::Open);

        let mut expired = ctx(dec!(10));
        expired.expires_at = now - Duration::seconds(1);
        let t = transition(SessionState::AwaitingAction, expired, &SessionEvent::Timeout, now);
        assert_eq!(t.state, SessionState::Expired);
    }

    #[test]
    fn abandon_is_terminal() {
        let now = Utc::now();
        let t = transition(SessionState::Open, ctx(dec!(10)), &SessionEvent::Abandon, now);
        assert_eq!(t.state, SessionState::Abandoned);
        assert!(t.context.abandoned_at.is_some());
    }

    #[test]
    fn terminal_states_absorb_every_event() {
        let now = Utc::now();
        let events: Vec<SessionEvent> = vec![
            SessionEvent::UpdateSession(SessionUpdate::default()),
            SessionEvent::InitiatePayment,
            SessionEvent::PaymentSucceeded { amount: dec!(10) },
            SessionEvent::PaymentFailed { code: None, message: None },
            SessionEvent::RequiresAction { redirect_url: "https://x".into() },
            SessionEvent::ActionCompleted,
            SessionEvent::ActionFailed,
            SessionEvent::Timeout,
            SessionEvent::Abandon,
        ];
        for terminal in [SessionState::Completed, SessionState::Expired, SessionState::Abandoned] {
            for event in &events {
                let t = transition(terminal, ctx(dec!(10)), event, now);
                assert_eq!(t.state, terminal, "{:?} left terminal via {}", terminal, event.name());
                assert!(!t.changed_state);
            }
        }
    }

    #[test]
    fn update_merges_fields_and_clears_error() {
        let now = Utc::now();
        let mut c = ctx(dec!(10));
        c.last_error = Some("previous validation error".into());
        let update = SessionUpdate {
            customer_email: Some("new@example.com".into()),
            variant_choices: Some(serde_json::json!({"size": "L"})),
            ..Default::default()
        };
        let t = transition(SessionState::Open, c, &SessionEvent::UpdateSession(update), now);
        assert_eq!(t.context.customer_email.as_deref(), Some("new@example.com"));
        assert_eq!(t.context.last_error, None);
    }

    #[test]
    fn amount_update_requires_pay_what_you_want() {
        let now = Utc::now();
        let update = SessionUpdate { amount: Some(dec!(500)), ..Default::default() };

        let fixed = transition(
            SessionState::Open,
            ctx(dec!(10)),
            &SessionEvent::UpdateSession(update.clone()),
            now,
        );
        assert_eq!(fixed.context.amount, dec!(10));

        let mut pwyw = ctx(dec!(10));
        pwyw.allow_custom_amount = true;
        let t = transition(SessionState::Open, pwyw, &SessionEvent::UpdateSession(update.clone()), now);
        assert_eq!(t.context.amount, dec!(500));

        // But not once an attempt has been made
        let mut attempted = ctx(dec!(10));
        attempted.allow_custom_amount = true;
        attempted.attempts = vec![failed_attempt(1, "card_declined")];
        let t = transition(SessionState::Open, attempted, &SessionEvent::UpdateSession(update), now);
        assert_eq!(t.context.amount, dec!(10));
    }

    #[test]
    fn failure_updates_in_flight_attempt_instead_of_appending() {
        let now = Utc::now();
        let mut c = ctx(dec!(25));
        c.attempts = vec![AttemptRecord {
            sequence: 1,
            outcome: AttemptOutcome::Pending,
            requires_action: false,
            redirect_url: None,
            failure_code: None,
            failure_message: None,
        }];
        let t = transition(
            SessionState::Processing,
            c,
            &SessionEvent::PaymentFailed {
                code: Some("card_declined".to_string()),
                message: None,
            },
            now,
        );
        assert_eq!(t.context.attempts.len(), 1);
        assert_eq!(t.context.attempts[0].outcome, AttemptOutcome::Failed);
        assert_eq!(
            t.context.attempts[0].failure_code.as_deref(),
            Some("card_declined")
        );
    }

    #[test]
    fn out_of_order_callbacks_are_ignored() {
        let now = Utc::now();
        // A success callback while still Open (intent never created) is a no-op.
        let t = transition(
            SessionState::Open,
            ctx(dec!(10)),
            &SessionEvent::PaymentSucceeded { amount: dec!(10) },
            now,
        );
        assert_eq!(t.state, SessionState::Open);
        assert!(!t.changed_state);
    }
}
