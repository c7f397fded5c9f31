//! Exactly-once guards over at-least-once callers.
//!
//! Both guards serialize on a uniqueness constraint in the store rather than
//! on an in-process lock, so they hold across processes too.

pub mod event_store;
pub mod increment_guard;

pub use event_store::{EventStore, EventStoreError};
pub use increment_guard::{GuardError, IncrementGuard, IncrementOutcome};
