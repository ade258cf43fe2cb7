pub mod balance_transaction;
pub mod checkout_session;
pub mod idempotency_record;
pub mod payment;
pub mod payment_attempt;
pub mod webhook_delivery;
pub mod webhook_endpoint;
pub mod webhook_event;

pub use balance_transaction::Entity as BalanceTransaction;
pub use checkout_session::Entity as CheckoutSession;
pub use idempotency_record::Entity as IdempotencyRecord;
pub use payment::Entity as Payment;
pub use payment_attempt::Entity as PaymentAttempt;
pub use webhook_delivery::Entity as WebhookDelivery;
pub use webhook_endpoint::Entity as WebhookEndpoint;
pub use webhook_event::Entity as WebhookEvent;
