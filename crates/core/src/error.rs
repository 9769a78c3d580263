//! Error taxonomy for the idempotent write path.
//!
//! One closed enum covers every failure the executor can observe. Each
//! variant carries a fixed retry classification ([`ErrorClass`]), so callers
//! and the backoff policy never inspect error internals to decide whether a
//! retry is safe.

use thiserror::Error;

/// Result type used across the executor and its collaborators.
pub type ExecResult<T> = Result<T, ExecError>;

/// Retry classification of a failure.
///
/// `Transient` means a retry may succeed (infrastructure hiccup, lock
/// contention). `Permanent` means it never will (bad input, business
/// conflict) and the error must surface unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

/// Failure raised anywhere on the guarded write path.
///
/// Unknown failure modes classify `Permanent` (fail closed): retrying an
/// error we cannot name risks duplicated side effects.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// The idempotency key was empty or absent (caller error).
    #[error("invalid idempotency key: {0}")]
    InvalidKey(String),

    /// The store could not allocate a connection/transaction handle.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Write conflict / serialization failure detected at commit.
    #[error("transaction conflict: {0}")]
    TransactionConflict(String),

    /// The ledger already holds a record for this key.
    ///
    /// Resolved inside the executor via re-lookup; handlers should never see
    /// this variant.
    #[error("duplicate idempotency key: {0}")]
    DuplicateKey(String),

    /// A value failed validation (business rule).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A business-level conflict (e.g. duplicate natural key).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Anything we could not map onto the taxonomy.
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl ExecError {
    pub fn invalid_key(msg: impl Into<String>) -> Self {
        Self::InvalidKey(msg.into())
    }

    pub fn storage_unavailable(msg: impl Into<String>) -> Self {
        Self::StorageUnavailable(msg.into())
    }

    pub fn transaction_conflict(msg: impl Into<String>) -> Self {
        Self::TransactionConflict(msg.into())
    }

    pub fn duplicate_key(msg: impl Into<String>) -> Self {
        Self::DuplicateKey(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn unknown(msg: impl Into<String>) -> Self {
        Self::Unknown(msg.into())
    }

    /// Retry classification of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::StorageUnavailable(_) | Self::TransactionConflict(_) => ErrorClass::Transient,
            Self::InvalidKey(_)
            | Self::DuplicateKey(_)
            | Self::Validation(_)
            | Self::NotFound(_)
            | Self::Conflict(_)
            | Self::Unknown(_) => ErrorClass::Permanent,
        }
    }

    /// Whether a retry of the failed attempt may succeed.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// HTTP status an API layer should answer with for this error.
    ///
    /// Permanent failures map to 4xx; transient failures only reach a caller
    /// once retries are exhausted, so they map to 503.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidKey(_) => 400,
            Self::NotFound(_) => 404,
            Self::Conflict(_) | Self::DuplicateKey(_) => 409,
            Self::Validation(_) => 422,
            Self::StorageUnavailable(_) | Self::TransactionConflict(_) => 503,
            Self::Unknown(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_variants_classify_transient() {
        assert_eq!(
            ExecError::storage_unavailable("pool exhausted").class(),
            ErrorClass::Transient
        );
        assert_eq!(
            ExecError::transaction_conflict("serialization failure").class(),
            ErrorClass::Transient
        );
    }

    #[test]
    fn business_errors_classify_permanent() {
        assert_eq!(ExecError::validation("bad").class(), ErrorClass::Permanent);
        assert_eq!(ExecError::not_found("tour").class(), ErrorClass::Permanent);
        assert_eq!(ExecError::conflict("slug taken").class(), ErrorClass::Permanent);
        assert_eq!(ExecError::invalid_key("empty").class(), ErrorClass::Permanent);
    }

    #[test]
    fn unknown_fails_closed() {
        assert_eq!(ExecError::unknown("???").class(), ErrorClass::Permanent);
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(ExecError::invalid_key("").http_status(), 400);
        assert_eq!(ExecError::not_found("x").http_status(), 404);
        assert_eq!(ExecError::conflict("x").http_status(), 409);
        assert_eq!(ExecError::validation("x").http_status(), 422);
        assert_eq!(ExecError::storage_unavailable("x").http_status(), 503);
        assert_eq!(ExecError::transaction_conflict("x").http_status(), 503);
        assert_eq!(ExecError::unknown("x").http_status(), 500);
    }
}
