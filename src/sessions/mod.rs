pub mod machine;
pub mod store;

pub use machine::{
    can_retry, is_amount_valid, is_valid_for_payment, transition, AttemptOutcome, AttemptRecord,
    SessionContext, SessionEvent, SessionState, SessionUpdate, Transition,
};
pub use store::{SessionSnapshot, SessionStore};
