pub mod checkout;
pub mod idempotency;
pub mod ledger;
pub mod webhooks;
