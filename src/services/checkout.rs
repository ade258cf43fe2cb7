//! Checkout orchestrator.
//!
//! Owns the side effects around the pure session machine: durable rows, PSP
//! calls, ledger writes, and webhook events. Every mutating path takes the
//! per-session lock from the store and holds it across the whole
//! read-transition-write cycle, so a client update can never interleave with
//! a provider callback for the same session.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    config::AppConfig,
    entities::{
        balance_transaction::TransactionType,
        checkout_session::{self, SessionStatus},
        payment::{self, PaymentStatus},
        payment_attempt::{self, AttemptStatus},
        CheckoutSession, Payment, PaymentAttempt,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    psp::PspClient,
    sessions::{
        machine::{
            transition, AttemptOutcome, AttemptRecord, SessionContext, SessionEvent, SessionState,
            SessionUpdate, Transition,
        },
        store::{SessionSnapshot, SessionStore},
    },
    services::ledger::{LedgerService, TransactionRefs},
    services::webhooks::WebhookService,
};

#[derive(Clone, Debug, Deserialize, Validate)]
pub struct CreateSessionRequest {
    pub store_id: Uuid,
    pub page_id: Uuid,

    pub amount: Decimal,

    /// Defaults to the platform currency when omitted.
    #[validate(length(min = 3, max = 3))]
    pub currency: Option<String>,

    #[serde(default)]
    pub allow_custom_amount: bool,

    pub customer_id: Option<Uuid>,

    #[validate(email)]
    pub customer_email: Option<String>,

    pub variant_choices: Option<serde_json::Value>,
    pub coupon_id: Option<Uuid>,
    pub discount_amount: Option<Decimal>,
}

/// Client-facing session representation, built from the machine snapshot.
#[derive(Clone, Debug, Serialize)]
pub struct SessionView {
    pub id: Uuid,
    pub store_id: Uuid,
    pub status: SessionState,
    pub amount: Decimal,
    pub currency: String,
    pub customer_id: Option<Uuid>,
    pub customer_email: Option<String>,
    pub allow_custom_amount: bool,
    pub variant_choices: Option<serde_json::Value>,
    pub coupon_id: Option<Uuid>,
    pub discount_amount: Decimal,
    pub attempt_count: usize,
    pub last_error: Option<String>,
    /// Set while the session awaits a customer action (3-D-Secure etc.).
    pub redirect_url: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub abandoned_at: Option<DateTime<Utc>>,
}

impl SessionView {
    fn from_snapshot(snapshot: &SessionSnapshot) -> Self {
        let ctx = &snapshot.context;
        Self {
            id: ctx.session_id,
            store_id: ctx.store_id,
            status: snapshot.state,
            amount: ctx.amount,
            currency: ctx.currency.clone(),
            customer_id: ctx.customer_id,
            customer_email: ctx.customer_email.clone(),
            allow_custom_amount: ctx.allow_custom_amount,
            variant_choices: ctx.variant_choices.clone(),
            coupon_id: ctx.coupon_id,
            discount_amount: ctx.discount_amount,
            attempt_count: ctx.attempts.len(),
            last_error: ctx.last_error.clone(),
            redirect_url: ctx.redirect_url.clone(),
            expires_at: ctx.expires_at,
            completed_at: ctx.completed_at,
            abandoned_at: ctx.abandoned_at,
        }
    }

    fn from_transition(t: &Transition) -> Self {
        Self::from_snapshot(&SessionSnapshot {
            state: t.state,
            context: t.context.clone(),
        })
    }
}

#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DatabaseConnection>,
    config: Arc<AppConfig>,
    store: SessionStore,
    ledger: LedgerService,
    webhooks: WebhookService,
    psp: Arc<dyn PspClient>,
    event_sender: EventSender,
}

impl CheckoutService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: Arc<AppConfig>,
        store: SessionStore,
        ledger: LedgerService,
        webhooks: WebhookService,
        psp: Arc<dyn PspClient>,
        event_sender: EventSender,
    ) -> Self {
        Self {
            db,
            config,
            store,
            ledger,
            webhooks,
            psp,
            event_sender,
        }
    }

    // ---- client-facing operations ----

    #[instrument(skip(self, req))]
    pub async fn create_session(
        &self,
        req: CreateSessionRequest,
    ) -> Result<SessionView, ServiceError> {
        req.validate()?;
        if req.amount < Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "amount must not be negative".to_string(),
            ));
        }
        if req.amount == Decimal::ZERO && !req.allow_custom_amount {
            return Err(ServiceError::ValidationError(
                "amount must be greater than zero for fixed-price sessions".to_string(),
            ));
        }

        let now = Utc::now();
        let currency = req
            .currency
            .unwrap_or_else(|| self.config.default_currency.clone())
            .to_uppercase();
        let expires_at = now + Duration::minutes(self.config.session_ttl_minutes);
        let session_id = Uuid::new_v4();

        checkout_session::ActiveModel {
            id: Set(session_id),
            store_id: Set(req.store_id),
            page_id: Set(req.page_id),
            customer_id: Set(req.customer_id),
            customer_email: Set(req.customer_email.clone()),
            amount: Set(req.amount),
            currency: Set(currency.clone()),
            allow_custom_amount: Set(req.allow_custom_amount),
            variant_choices: Set(req.variant_choices.clone()),
            coupon_id: Set(req.coupon_id),
            discount_amount: Set(req.discount_amount.unwrap_or(Decimal::ZERO)),
            current_payment_id: Set(None),
            status: Set(SessionStatus::Open),
            last_error: Set(None),
            expires_at: Set(expires_at),
            completed_at: Set(None),
            abandoned_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await?;

        let context = SessionContext {
            session_id,
            store_id: req.store_id,
            amount: req.amount,
            currency,
            customer_id: req.customer_id,
            customer_email: req.customer_email,
            allow_custom_amount: req.allow_custom_amount,
            variant_choices: req.variant_choices,
            coupon_id: req.coupon_id,
            discount_amount: req.discount_amount.unwrap_or(Decimal::ZERO),
            expires_at,
            attempts: Vec::new(),
            last_error: None,
            redirect_url: None,
            completed_at: None,
            abandoned_at: None,
        };
        let seed = Transition {
            state: SessionState::Open,
            context,
            changed_state: false,
        };
        self.store.persist(SessionState::Open, &seed).await?;

        info!(session_id = %session_id, store_id = %req.store_id, "checkout session created");
        self.event_sender.send(Event::SessionCreated(session_id)).await;
        Ok(SessionView::from_transition(&seed))
    }

    pub async fn get_session(&self, session_id: Uuid) -> Result<SessionView, ServiceError> {
        let snapshot = self.store.load(session_id).await?;
        Ok(SessionView::from_snapshot(&snapshot))
    }

    #[instrument(skip(self, update))]
    pub async fn update_session(
        &self,
        session_id: Uuid,
        update: SessionUpdate,
    ) -> Result<SessionView, ServiceError> {
        if let Some(email) = &update.customer_email {
            if !email.contains('@') {
                return Err(ServiceError::ValidationError(
                    "customer_email is not a valid email address".to_string(),
                ));
            }
        }

        let lock = self.store.lock_for(session_id);
        let _guard = lock.lock().await;
        let now = Utc::now();
        let snapshot = self.require_live(session_id, now).await?;

        let prev = snapshot.state;
        let t = transition(
            prev,
            snapshot.context,
            &SessionEvent::UpdateSession(update),
            now,
        );
        self.store.persist(prev, &t).await?;
        self.store.mirror_context_fields(&t.context).await?;
        self.event_sender.send(Event::SessionUpdated(session_id)).await;
        Ok(SessionView::from_transition(&t))
    }

    /// Validates the session, creates the payment and attempt rows, and asks
    /// the provider for an intent. The session lands in `processing` (or
    /// `awaiting_action`); settlement arrives later through a PSP callback.
    #[instrument(skip(self))]
    pub async fn initiate_payment(&self, session_id: Uuid) -> Result<SessionView, ServiceError> {
        let lock = self.store.lock_for(session_id);
        let _guard = lock.lock().await;
        let now = Utc::now();
        let snapshot = self.require_live(session_id, now).await?;

        let prev = snapshot.state;
        let t = transition(prev, snapshot.context, &SessionEvent::InitiatePayment, now);
        if !t.changed_state {
            if let Some(reason) = t.context.last_error.clone() {
                // Guard rejection: recorded on the session, not an attempt.
                self.store.persist(prev, &t).await?;
                return Err(ServiceError::ValidationError(reason));
            }
            return Err(ServiceError::InvalidOperation(format!(
                "cannot initiate payment while session is {:?}",
                prev
            )));
        }
        let mut ctx = t.context;

        let payment = self.ensure_payment(&ctx, now).await?;

        let sequence = ctx.next_sequence();
        ctx.attempts.push(AttemptRecord {
            sequence,
            outcome: AttemptOutcome::Pending,
            requires_action: false,
            redirect_url: None,
            failure_code: None,
            failure_message: None,
        });
        payment_attempt::ActiveModel {
            id: Set(Uuid::new_v4()),
            payment_id: Set(payment.id),
            attempt_number: Set(sequence),
            status: Set(AttemptStatus::Pending),
            psp_intent_id: Set(None),
            requires_action: Set(false),
            redirect_url: Set(None),
            failure_code: Set(None),
            failure_message: Set(None),
            created_at: Set(now),
        }
        .insert(&*self.db)
        .await?;

        let metadata = serde_json::json!({ "session_id": session_id.to_string() });
        match self
            .psp
            .create_payment_intent(ctx.amount, &ctx.currency, metadata)
            .await
        {
            Ok(intent) => {
                self.record_intent(&payment, sequence, &intent.id).await?;
                if intent.requires_action {
                    let url = intent.next_action_url.unwrap_or_default();
                    let t2 = transition(
                        SessionState::Processing,
                        ctx,
                        &SessionEvent::RequiresAction { redirect_url: url },
                        now,
                    );
                    self.sync_last_attempt(payment.id, &t2.context).await?;
                    self.store.persist(prev, &t2).await?;
                    self.event_sender
                        .send(Event::PaymentRequiresAction {
                            session_id,
                            payment_id: payment.id,
                        })
                        .await;
                    Ok(SessionView::from_transition(&t2))
                } else {
                    let t2 = Transition {
                        state: SessionState::Processing,
                        context: ctx,
                        changed_state: true,
                    };
                    self.store.persist(prev, &t2).await?;
                    self.event_sender
                        .send(Event::PaymentInitiated {
                            session_id,
                            payment_id: payment.id,
                            attempt_number: sequence,
                        })
                        .await;
                    Ok(SessionView::from_transition(&t2))
                }
            }
            Err(e) => {
                // Provider failure burns the attempt; the machine decides
                // whether the session may retry.
                let t2 = transition(
                    SessionState::Processing,
                    ctx,
                    &SessionEvent::PaymentFailed {
                        code: Some("provider_error".to_string()),
                        message: Some(e.response_message()),
                    },
                    now,
                );
                self.sync_last_attempt(payment.id, &t2.context).await?;
                self.store.persist(prev, &t2).await?;
                if t2.state == SessionState::Expired {
                    self.retire_session(&t2.context).await?;
                }
                self.event_sender
                    .send(Event::PaymentFailed {
                        payment_id: payment.id,
                        failure_code: Some("provider_error".to_string()),
                    })
                    .await;
                Err(e)
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn abandon_session(&self, session_id: Uuid) -> Result<SessionView, ServiceError> {
        let lock = self.store.lock_for(session_id);
        let _guard = lock.lock().await;
        let now = Utc::now();
        let snapshot = self.store.load(session_id).await?;
        if snapshot.state.is_terminal() {
            return Err(ServiceError::SessionTerminal(session_id));
        }

        let prev = snapshot.state;
        let t = transition(prev, snapshot.context, &SessionEvent::Abandon, now);
        if !t.changed_state {
            return Err(ServiceError::InvalidOperation(
                "only open sessions can be abandoned".to_string(),
            ));
        }
        self.store.persist(prev, &t).await?;
        self.store.evict(session_id).await;

        self.webhooks
            .create_event(
                t.context.store_id,
                "checkout.abandoned",
                "checkout_session",
                &session_id.to_string(),
                serde_json::json!({
                    "session_id": session_id.to_string(),
                    "amount": t.context.amount,
                    "currency": t.context.currency,
                }),
            )
            .await?;
        self.event_sender.send(Event::SessionAbandoned(session_id)).await;
        Ok(SessionView::from_transition(&t))
    }

    // ---- provider callbacks ----

    /// Settlement callback. Completes the session, marks the payment
    /// succeeded, appends the two ledger rows, and emits merchant webhooks.
    /// Idempotent: callbacks for already-terminal sessions are ignored.
    #[instrument(skip(self))]
    pub async fn handle_payment_succeeded(
        &self,
        session_id: Uuid,
        reported_amount: Decimal,
    ) -> Result<(), ServiceError> {
        let lock = self.store.lock_for(session_id);
        let _guard = lock.lock().await;
        let now = Utc::now();
        let snapshot = self.store.load(session_id).await?;
        if snapshot.state.is_terminal() {
            debug!(session_id = %session_id, "success callback for terminal session ignored");
            return Ok(());
        }

        let prev = snapshot.state;
        let t = transition(
            prev,
            snapshot.context,
            &SessionEvent::PaymentSucceeded {
                amount: reported_amount,
            },
            now,
        );

        if t.state != SessionState::Completed {
            if t.changed_state {
                // Amount mismatch: the machine reopened the session with the
                // discrepancy recorded. Never settle on mismatched amounts;
                // the callback is answered with the discrepancy.
                warn!(
                    session_id = %session_id,
                    expected = %t.context.amount,
                    reported = %reported_amount,
                    "settlement amount mismatch"
                );
                let expected = t.context.amount;
                self.store.persist(prev, &t).await?;
                return Err(ServiceError::AmountMismatch {
                    expected: expected.to_string(),
                    actual: reported_amount.to_string(),
                });
            }
            return Ok(());
        }

        let payment = self.find_payment(session_id).await?;
        let gross = t.context.amount;
        let fee = (gross * self.config.platform_fee_rate()).round_dp(2);
        let net = gross - fee;

        let mut active: payment::ActiveModel = payment.clone().into();
        active.status = Set(PaymentStatus::Succeeded);
        active.platform_fee = Set(fee);
        active.net_amount = Set(net);
        active.completed_at = Set(Some(now));
        active.updated_at = Set(now);
        active.update(&*self.db).await?;

        self.sync_last_attempt(payment.id, &t.context).await?;
        self.store.persist(prev, &t).await?;
        self.store.evict(session_id).await;

        let store_id = t.context.store_id;
        let currency = t.context.currency.clone();
        let refs = TransactionRefs {
            payment_id: Some(payment.id),
            ..Default::default()
        };
        self.ledger
            .add_transaction(
                store_id,
                TransactionType::PaymentReceived,
                gross,
                &currency,
                refs,
                Some(format!("checkout session {}", session_id)),
            )
            .await?;
        if fee > Decimal::ZERO {
            self.ledger
                .add_transaction(
                    store_id,
                    TransactionType::Fee,
                    -fee,
                    &currency,
                    refs,
                    Some(format!("platform fee for payment {}", payment.id)),
                )
                .await?;
        }

        self.webhooks
            .create_event(
                store_id,
                "payment.completed",
                "payment",
                &payment.id.to_string(),
                serde_json::json!({
                    "payment_id": payment.id.to_string(),
                    "session_id": session_id.to_string(),
                    "amount": gross,
                    "currency": currency,
                    "platform_fee": fee,
                    "net_amount": net,
                }),
            )
            .await?;
        self.webhooks
            .create_event(
                store_id,
                "checkout.completed",
                "checkout_session",
                &session_id.to_string(),
                serde_json::json!({
                    "session_id": session_id.to_string(),
                    "amount": gross,
                    "currency": currency,
                    "customer_email": t.context.customer_email,
                }),
            )
            .await?;

        info!(
            session_id = %session_id,
            payment_id = %payment.id,
            amount = %gross,
            fee = %fee,
            "checkout session completed"
        );
        self.event_sender.send(Event::PaymentSucceeded(payment.id)).await;
        self.event_sender
            .send(Event::SessionCompleted {
                session_id,
                payment_id: payment.id,
                amount: gross,
                currency,
            })
            .await;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn handle_payment_failed(
        &self,
        session_id: Uuid,
        failure_code: Option<String>,
        failure_message: Option<String>,
    ) -> Result<(), ServiceError> {
        let lock = self.store.lock_for(session_id);
        let _guard = lock.lock().await;
        let now = Utc::now();
        let snapshot = self.store.load(session_id).await?;
        if snapshot.state.is_terminal() {
            return Ok(());
        }

        let prev = snapshot.state;
        let t = transition(
            prev,
            snapshot.context,
            &SessionEvent::PaymentFailed {
                code: failure_code.clone(),
                message: failure_message,
            },
            now,
        );
        if !t.changed_state {
            return Ok(());
        }

        if let Some(payment) = self.try_find_payment(session_id).await? {
            self.sync_last_attempt(payment.id, &t.context).await?;
            self.event_sender
                .send(Event::PaymentFailed {
                    payment_id: payment.id,
                    failure_code,
                })
                .await;
        }
        self.store.persist(prev, &t).await?;
        if t.state == SessionState::Expired {
            self.store.evict(session_id).await;
            self.retire_session(&t.context).await?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn handle_requires_action(
        &self,
        session_id: Uuid,
        redirect_url: String,
    ) -> Result<(), ServiceError> {
        let lock = self.store.lock_for(session_id);
        let _guard = lock.lock().await;
        let now = Utc::now();
        let snapshot = self.store.load(session_id).await?;
        if snapshot.state.is_terminal() {
            return Ok(());
        }

        let prev = snapshot.state;
        let t = transition(
            prev,
            snapshot.context,
            &SessionEvent::RequiresAction { redirect_url },
            now,
        );
        if !t.changed_state {
            return Ok(());
        }
        if let Some(payment) = self.try_find_payment(session_id).await? {
            self.sync_last_attempt(payment.id, &t.context).await?;
            self.event_sender
                .send(Event::PaymentRequiresAction {
                    session_id,
                    payment_id: payment.id,
                })
                .await;
        }
        self.store.persist(prev, &t).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn handle_action_completed(&self, session_id: Uuid) -> Result<(), ServiceError> {
        let lock = self.store.lock_for(session_id);
        let _guard = lock.lock().await;
        let now = Utc::now();
        let snapshot = self.store.load(session_id).await?;
        if snapshot.state.is_terminal() {
            return Ok(());
        }

        let prev = snapshot.state;
        let t = transition(prev, snapshot.context, &SessionEvent::ActionCompleted, now);
        if t.changed_state {
            self.store.persist(prev, &t).await?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn handle_action_failed(&self, session_id: Uuid) -> Result<(), ServiceError> {
        let lock = self.store.lock_for(session_id);
        let _guard = lock.lock().await;
        let now = Utc::now();
        let snapshot = self.store.load(session_id).await?;
        if snapshot.state.is_terminal() {
            return Ok(());
        }

        let prev = snapshot.state;
        let t = transition(prev, snapshot.context, &SessionEvent::ActionFailed, now);
        if !t.changed_state {
            return Ok(());
        }
        if let Some(payment) = self.try_find_payment(session_id).await? {
            self.sync_last_attempt(payment.id, &t.context).await?;
        }
        self.store.persist(prev, &t).await?;
        if t.state == SessionState::Expired {
            self.store.evict(session_id).await;
            self.retire_session(&t.context).await?;
        }
        Ok(())
    }

    // ---- background sweep ----

    /// Expires open and awaiting-action sessions past their deadline.
    /// Returns how many sessions were expired this pass.
    pub async fn expire_due_sessions(&self, now: DateTime<Utc>) -> Result<usize, ServiceError> {
        let due = CheckoutSession::find()
            .filter(
                Condition::any()
                    .add(checkout_session::Column::Status.eq(SessionStatus::Open))
                    .add(checkout_session::Column::Status.eq(SessionStatus::AwaitingAction)),
            )
            .filter(checkout_session::Column::ExpiresAt.lte(now))
            .all(&*self.db)
            .await?;

        let mut expired = 0;
        for row in due {
            let session_id = row.id;
            let lock = self.store.lock_for(session_id);
            let _guard = lock.lock().await;

            // State may have moved while we waited for the lock.
            let snapshot = self.store.load(session_id).await?;
            let prev = snapshot.state;
            let t = transition(prev, snapshot.context, &SessionEvent::Timeout, now);
            if !t.changed_state {
                continue;
            }
            self.store.persist(prev, &t).await?;
            self.store.evict(session_id).await;
            self.retire_session(&t.context).await?;
            expired += 1;
        }
        if expired > 0 {
            info!("expired {} checkout sessions", expired);
        }
        Ok(expired)
    }

    // ---- helpers ----

    /// Loads a session that must still accept client operations. Sessions
    /// past their deadline are expired on the spot before erroring.
    async fn require_live(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<SessionSnapshot, ServiceError> {
        let snapshot = self.store.load(session_id).await?;
        if snapshot.state.is_terminal() {
            return if snapshot.state == SessionState::Expired {
                Err(ServiceError::SessionExpired(session_id))
            } else {
                Err(ServiceError::SessionTerminal(session_id))
            };
        }
        if snapshot.context.is_expired(now) && snapshot.state != SessionState::Processing {
            let prev = snapshot.state;
            let t = transition(prev, snapshot.context, &SessionEvent::Timeout, now);
            if t.changed_state {
                self.store.persist(prev, &t).await?;
                self.store.evict(session_id).await;
                self.retire_session(&t.context).await?;
            }
            return Err(ServiceError::SessionExpired(session_id));
        }
        Ok(snapshot)
    }

    /// Creates the 1:1 payment row on first initiation; later retries reuse it.
    async fn ensure_payment(
        &self,
        ctx: &SessionContext,
        now: DateTime<Utc>,
    ) -> Result<payment::Model, ServiceError> {
        if let Some(existing) = self.try_find_payment(ctx.session_id).await? {
            return Ok(existing);
        }
        let created = payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            session_id: Set(ctx.session_id),
            store_id: Set(ctx.store_id),
            amount: Set(ctx.amount),
            currency: Set(ctx.currency.clone()),
            status: Set(PaymentStatus::Processing),
            psp_intent_id: Set(None),
            platform_fee: Set(Decimal::ZERO),
            net_amount: Set(Decimal::ZERO),
            completed_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await?;
        self.store
            .set_current_payment(ctx.session_id, created.id)
            .await?;
        Ok(created)
    }

    async fn find_payment(&self, session_id: Uuid) -> Result<payment::Model, ServiceError> {
        self.try_find_payment(session_id).await?.ok_or_else(|| {
            ServiceError::NotFound(format!("payment for session {} not found", session_id))
        })
    }

    async fn try_find_payment(
        &self,
        session_id: Uuid,
    ) -> Result<Option<payment::Model>, ServiceError> {
        Ok(Payment::find()
            .filter(payment::Column::SessionId.eq(session_id))
            .one(&*self.db)
            .await?)
    }

    async fn record_intent(
        &self,
        pay: &payment::Model,
        attempt_number: i32,
        intent_id: &str,
    ) -> Result<(), ServiceError> {
        if pay.psp_intent_id.is_none() {
            let mut active: payment::ActiveModel = pay.clone().into();
            active.psp_intent_id = Set(Some(intent_id.to_string()));
            active.updated_at = Set(Utc::now());
            active.update(&*self.db).await?;
        }
        if let Some(row) = PaymentAttempt::find()
            .filter(payment_attempt::Column::PaymentId.eq(pay.id))
            .filter(payment_attempt::Column::AttemptNumber.eq(attempt_number))
            .one(&*self.db)
            .await?
        {
            let mut active: payment_attempt::ActiveModel = row.into();
            active.psp_intent_id = Set(Some(intent_id.to_string()));
            active.update(&*self.db).await?;
        }
        Ok(())
    }

    /// Reconciles the machine's latest attempt record into its durable row,
    /// inserting one when the machine appended out-of-band.
    async fn sync_last_attempt(
        &self,
        payment_id: Uuid,
        ctx: &SessionContext,
    ) -> Result<(), ServiceError> {
        let Some(record) = ctx.attempts.last() else {
            return Ok(());
        };
        let status = match record.outcome {
            AttemptOutcome::Pending => AttemptStatus::Pending,
            AttemptOutcome::RequiresAction => AttemptStatus::RequiresAction,
            AttemptOutcome::Succeeded => AttemptStatus::Succeeded,
            AttemptOutcome::Failed => AttemptStatus::Failed,
        };
        match PaymentAttempt::find()
            .filter(payment_attempt::Column::PaymentId.eq(payment_id))
            .filter(payment_attempt::Column::AttemptNumber.eq(record.sequence))
            .one(&*self.db)
            .await?
        {
            Some(row) => {
                let mut active: payment_attempt::ActiveModel = row.into();
                active.status = Set(status);
                active.requires_action = Set(record.requires_action);
                active.redirect_url = Set(record.redirect_url.clone());
                active.failure_code = Set(record.failure_code.clone());
                active.failure_message = Set(record.failure_message.clone());
                active.update(&*self.db).await?;
            }
            None => {
                payment_attempt::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    payment_id: Set(payment_id),
                    attempt_number: Set(record.sequence),
                    status: Set(status),
                    psp_intent_id: Set(None),
                    requires_action: Set(record.requires_action),
                    redirect_url: Set(record.redirect_url.clone()),
                    failure_code: Set(record.failure_code.clone()),
                    failure_message: Set(record.failure_message.clone()),
                    created_at: Set(Utc::now()),
                }
                .insert(&*self.db)
                .await?;
            }
        }
        Ok(())
    }

    /// Side effects shared by every path into `Expired`: the unsettled
    /// payment is marked failed and the merchant is notified.
    async fn retire_session(&self, ctx: &SessionContext) -> Result<(), ServiceError> {
        if let Some(pay) = self.try_find_payment(ctx.session_id).await? {
            if !pay.status.is_settled() {
                let mut active: payment::ActiveModel = pay.into();
                active.status = Set(PaymentStatus::Failed);
                active.updated_at = Set(Utc::now());
                active.update(&*self.db).await?;
            }
        }
        self.webhooks
            .create_event(
                ctx.store_id,
                "checkout.expired",
                "checkout_session",
                &ctx.session_id.to_string(),
                serde_json::json!({
                    "session_id": ctx.session_id.to_string(),
                    "amount": ctx.amount,
                    "currency": ctx.currency,
                    "attempts": ctx.attempts.len(),
                }),
            )
            .await?;
        self.event_sender
            .send(Event::SessionExpired(ctx.session_id))
            .await;
        Ok(())
    }
}
