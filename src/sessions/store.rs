//! Persistence adapter for the session state machine.
//!
//! The fast cache is the source of truth for in-flight machine context,
//! snapshotted after every transition with a 24-hour TTL. The durable
//! `checkout_sessions` row only mirrors the coarse status (plus completion
//! and abandon timestamps) and is the fallback when the cache entry is
//! missing: context is then rebuilt from the session row and its stored
//! payment attempts.
//!
//! Two concurrent writers to the same session are possible (a client update
//! racing a PSP callback), so every read-transition-write cycle must hold
//! the session's lock from `lock_for`. Single-writer-per-key, in process.

use chrono::Utc;
use dashmap::DashMap;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    cache::{self, CacheBackend},
    entities::{
        checkout_session, payment, payment_attempt, CheckoutSession, Payment, PaymentAttempt,
    },
    errors::ServiceError,
    sessions::machine::{
        AttemptOutcome, AttemptRecord, SessionContext, SessionState, Transition,
    },
};

/// Cached `(state, context)` pair.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub context: SessionContext,
}

#[derive(Clone)]
pub struct SessionStore {
    db: Arc<DatabaseConnection>,
    cache: Arc<dyn CacheBackend>,
    locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
    snapshot_ttl: Duration,
}

fn snapshot_key(session_id: Uuid) -> String {
    format!("session:{}", session_id)
}

impl SessionStore {
    pub fn new(
        db: Arc<DatabaseConnection>,
        cache: Arc<dyn CacheBackend>,
        snapshot_ttl: Duration,
    ) -> Self {
        Self {
            db,
            cache,
            locks: Arc::new(DashMap::new()),
            snapshot_ttl,
        }
    }

    /// Per-session mutex. Hold this across the whole read-transition-write
    /// cycle; releasing between read and write reopens the dual-writer race.
    pub fn lock_for(&self, session_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(session_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Loads the machine snapshot, rebuilding from the durable store when
    /// the cache entry is missing or unreadable.
    pub async fn load(&self, session_id: Uuid) -> Result<SessionSnapshot, ServiceError> {
        match cache::get_json::<SessionSnapshot>(self.cache.as_ref(), &snapshot_key(session_id))
            .await
        {
            Ok(Some(snapshot)) => return Ok(snapshot),
            Ok(None) => {}
            Err(e) => warn!("session snapshot cache read failed for {}: {}", session_id, e),
        }

        debug!("rebuilding session {} from durable store", session_id);
        self.rebuild(session_id).await
    }

    /// Writes the post-transition snapshot to the cache, and mirrors the
    /// coarse status to the durable row when the state value changed.
    pub async fn persist(
        &self,
        previous: SessionState,
        transition: &Transition,
    ) -> Result<(), ServiceError> {
        let snapshot = SessionSnapshot {
            state: transition.state,
            context: transition.context.clone(),
        };
        let key = snapshot_key(snapshot.context.session_id);
        if let Err(e) =
            cache::set_json(self.cache.as_ref(), &key, &snapshot, Some(self.snapshot_ttl)).await
        {
            // The durable store remains authoritative; a failed snapshot only
            // costs a rebuild on the next load.
            warn!("session snapshot cache write failed for {}: {}", key, e);
        }

        if transition.state != previous {
            self.mirror_status(&snapshot).await?;
        }
        Ok(())
    }

    async fn mirror_status(&self, snapshot: &SessionSnapshot) -> Result<(), ServiceError> {
        let session_id = snapshot.context.session_id;
        let row = CheckoutSession::find_by_id(session_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("session {} not found", session_id)))?;

        let mut active: checkout_session::ActiveModel = row.into();
        active.status = Set(snapshot.state.as_status());
        active.last_error = Set(snapshot.context.last_error.clone());
        active.completed_at = Set(snapshot.context.completed_at);
        active.abandoned_at = Set(snapshot.context.abandoned_at);
        active.updated_at = Set(Utc::now());
        active.update(&*self.db).await?;
        Ok(())
    }

    /// Updates durable, non-status session fields after an UPDATE_SESSION
    /// merge so a later rebuild sees the same values the cache holds.
    pub async fn mirror_context_fields(&self, ctx: &SessionContext) -> Result<(), ServiceError> {
        let row = CheckoutSession::find_by_id(ctx.session_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("session {} not found", ctx.session_id))
            })?;

        let mut active: checkout_session::ActiveModel = row.into();
        active.amount = Set(ctx.amount);
        active.customer_id = Set(ctx.customer_id);
        active.customer_email = Set(ctx.customer_email.clone());
        active.variant_choices = Set(ctx.variant_choices.clone());
        active.coupon_id = Set(ctx.coupon_id);
        active.discount_amount = Set(ctx.discount_amount);
        active.updated_at = Set(Utc::now());
        active.update(&*self.db).await?;
        Ok(())
    }

    /// Records the payment id on the durable session row.
    pub async fn set_current_payment(
        &self,
        session_id: Uuid,
        payment_id: Uuid,
    ) -> Result<(), ServiceError> {
        let row = CheckoutSession::find_by_id(session_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("session {} not found", session_id)))?;
        let mut active: checkout_session::ActiveModel = row.into();
        active.current_payment_id = Set(Some(payment_id));
        active.updated_at = Set(Utc::now());
        active.update(&*self.db).await?;
        Ok(())
    }

    /// Drops the cached snapshot. Terminal sessions are served from the
    /// durable row from then on.
    pub async fn evict(&self, session_id: Uuid) {
        let _ = self.cache.delete(&snapshot_key(session_id)).await;
    }

    async fn rebuild(&self, session_id: Uuid) -> Result<SessionSnapshot, ServiceError> {
        let row = CheckoutSession::find_by_id(session_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("session {} not found", session_id)))?;

        let attempts = match Payment::find()
            .filter(payment::Column::SessionId.eq(session_id))
            .one(&*self.db)
            .await?
        {
            Some(pay) => PaymentAttempt::find()
                .filter(payment_attempt::Column::PaymentId.eq(pay.id))
                .order_by_asc(payment_attempt::Column::AttemptNumber)
                .all(&*self.db)
                .await?
                .into_iter()
                .map(attempt_record)
                .collect(),
            None => Vec::new(),
        };

        let state = SessionState::from_status(row.status);
        let redirect_url = if state == SessionState::AwaitingAction {
            attempts
                .iter()
                .rev()
                .find_map(|a: &AttemptRecord| a.redirect_url.clone())
        } else {
            None
        };

        let context = SessionContext {
            session_id: row.id,
            store_id: row.store_id,
            amount: row.amount,
            currency: row.currency,
            customer_id: row.customer_id,
            customer_email: row.customer_email,
            allow_custom_amount: row.allow_custom_amount,
            variant_choices: row.variant_choices,
            coupon_id: row.coupon_id,
            discount_amount: row.discount_amount,
            expires_at: row.expires_at,
            attempts,
            last_error: row.last_error,
            redirect_url,
            completed_at: row.completed_at,
            abandoned_at: row.abandoned_at,
        };

        Ok(SessionSnapshot { state, context })
    }
}

fn attempt_record(row: payment_attempt::Model) -> AttemptRecord {
    let outcome = match row.status {
        payment_attempt::AttemptStatus::Pending => AttemptOutcome::Pending,
        payment_attempt::AttemptStatus::RequiresAction => AttemptOutcome::RequiresAction,
        payment_attempt::AttemptStatus::Succeeded => AttemptOutcome::Succeeded,
        payment_attempt::AttemptStatus::Failed => AttemptOutcome::Failed,
    };
    AttemptRecord {
        sequence: row.attempt_number,
        outcome,
        requires_action: row.requires_action,
        redirect_url: row.redirect_url,
        failure_code: row.failure_code,
        failure_message: row.failure_message,
    }
}
