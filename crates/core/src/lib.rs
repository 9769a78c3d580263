//! `dwell-core` — domain foundation for the idempotent write path.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! the error taxonomy, validated identifiers, and the replayable response
//! payload. Storage, retry policy, and the executor live in `dwell-infra`.

pub mod error;
pub mod id;
pub mod response;

pub use error::{ErrorClass, ExecError, ExecResult};
pub use id::{IdempotencyKey, RequestId};
pub use response::StoredResponse;
