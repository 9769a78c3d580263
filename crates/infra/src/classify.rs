//! Failure classification for raw store errors.
//!
//! SQLx errors are mapped onto the closed taxonomy as follows:
//!
//! | SQLx error | Postgres code | Mapped to | Class |
//! |------------|---------------|-----------|-------|
//! | Database (unique violation) | `23505` | `DuplicateKey` | absorbed via re-lookup |
//! | Database (serialization failure) | `40001` | `TransactionConflict` | Transient |
//! | Database (deadlock detected) | `40P01` | `TransactionConflict` | Transient |
//! | PoolTimedOut / PoolClosed / Io / Tls | n/a | `StorageUnavailable` | Transient |
//! | RowNotFound | n/a | `NotFound` | Permanent |
//! | anything else | any | `Unknown` | Permanent (fail closed) |

use dwell_core::ExecError;

/// Map a SQLx error raised during `operation` onto the taxonomy.
pub fn map_sqlx_error(operation: &str, err: sqlx::Error) -> ExecError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => ExecError::duplicate_key(msg),
                Some("40001") | Some("40P01") => ExecError::transaction_conflict(msg),
                _ => ExecError::unknown(msg),
            }
        }
        sqlx::Error::PoolTimedOut => {
            ExecError::storage_unavailable(format!("connection pool timed out in {operation}"))
        }
        sqlx::Error::PoolClosed => {
            ExecError::storage_unavailable(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::Io(e) => {
            ExecError::storage_unavailable(format!("i/o error in {operation}: {e}"))
        }
        sqlx::Error::Tls(e) => {
            ExecError::storage_unavailable(format!("tls error in {operation}: {e}"))
        }
        sqlx::Error::RowNotFound => ExecError::not_found(format!("row not found in {operation}")),
        other => ExecError::unknown(format!("sqlx error in {operation}: {other}")),
    }
}

/// Whether a SQLx error is a unique constraint violation.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
