pub mod balance;
pub mod common;
pub mod psp_webhooks;
pub mod sessions;
pub mod webhook_endpoints;

use std::sync::Arc;
use std::time::Duration;

use crate::cache::CacheBackend;
use crate::config::AppConfig;
use crate::db::DbPool;
use crate::events::EventSender;
use crate::psp::PspClient;
use crate::services::{
    checkout::CheckoutService, idempotency::IdempotencyService, ledger::LedgerService,
    webhooks::WebhookService,
};
use crate::sessions::store::SessionStore;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub checkout: Arc<CheckoutService>,
    pub ledger: Arc<LedgerService>,
    pub webhooks: Arc<WebhookService>,
    pub idempotency: Arc<IdempotencyService>,
}

impl AppServices {
    pub fn new(
        db_pool: Arc<DbPool>,
        config: Arc<AppConfig>,
        cache: Arc<dyn CacheBackend>,
        psp: Arc<dyn PspClient>,
        event_sender: EventSender,
    ) -> Self {
        let store = SessionStore::new(
            db_pool.clone(),
            cache.clone(),
            Duration::from_secs(config.session_snapshot_ttl_secs),
        );
        let ledger = Arc::new(LedgerService::new(db_pool.clone(), event_sender.clone()));
        let webhooks = Arc::new(WebhookService::new(
            db_pool.clone(),
            event_sender.clone(),
            config.delivery_max_attempts,
            Duration::from_secs(config.delivery_timeout_secs),
        ));
        let idempotency = Arc::new(IdempotencyService::new(
            db_pool.clone(),
            cache,
            config.idempotency_retention_days,
        ));
        let checkout = Arc::new(CheckoutService::new(
            db_pool,
            config,
            store,
            (*ledger).clone(),
            (*webhooks).clone(),
            psp,
            event_sender,
        ));

        Self {
            checkout,
            ledger,
            webhooks,
            idempotency,
        }
    }
}
