//! Infrastructure layer for the idempotent write path: backoff policy,
//! ledger-backed storage, unit of work, and the operation executor.
//!
//! The executor is the single reusable entry point API handlers call:
//! present an idempotency key plus a business operation, get back either the
//! response to serialize (possibly replayed from the ledger) or one terminal
//! classified error.

pub mod backoff;
pub mod classify;
pub mod executor;
pub mod store;
pub mod uow;


pub use backoff::{BackoffKind, BackoffPolicy, FixedJitter, JitterSource, NoJitter, ThreadRngJitter};
pub use executor::{Executor, ExecutorConfig, Operation, RetryContext};
pub use store::{IdempotencyRecord, LedgerStore};
pub use uow::{UnitOfWork, UowState};
