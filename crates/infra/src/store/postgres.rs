//! Postgres-backed ledger store.
//!
//! The ledger lives in a dedicated `idempotency_ledger` table, co-located
//! with business data so a ledger write commits in the same transaction as
//! the mutations it guards. Key uniqueness is the table's primary key; a
//! concurrent duplicate surfaces as `DuplicateKey`, either from a `23505`
//! unique violation or from the expire-aware upsert touching zero rows.
//! Expired-but-unpurged rows count as absent, matching lookups, so a
//! post-TTL replay re-executes instead of answering 409 until the purge
//! cron catches up.
//!
//! ## Thread safety
//!
//! `PostgresLedgerStore` is `Send + Sync`; all operations go through the
//! SQLx connection pool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{instrument, warn};

use dwell_core::{ExecError, ExecResult, IdempotencyKey, StoredResponse};

use super::{IdempotencyRecord, LedgerStore};
use crate::classify::map_sqlx_error;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS idempotency_ledger (
    key         TEXT PRIMARY KEY,
    response    JSONB NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    expires_at  TIMESTAMPTZ
)
"#;

/// Postgres implementation of [`LedgerStore`].
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: PgPool,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the ledger table if it does not exist.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> ExecResult<()> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    /// Delete expired ledger records; returns how many were removed.
    ///
    /// Purging is a housekeeping concern for an external cron; lookups
    /// already treat expired records as absent.
    #[instrument(skip(self), err)]
    pub async fn purge_expired(&self) -> ExecResult<u64> {
        let result = sqlx::query("DELETE FROM idempotency_ledger WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("purge_expired", e))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    type Tx = Transaction<'static, Postgres>;

    async fn begin(&self) -> ExecResult<Self::Tx> {
        // Any failure to allocate a handle reads as "store unavailable";
        // the caller's backoff policy decides whether to wait it out.
        self.pool
            .begin()
            .await
            .map_err(|e| ExecError::storage_unavailable(format!("begin failed: {e}")))
    }

    async fn commit(&self, tx: Self::Tx) -> ExecResult<()> {
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))
    }

    async fn abort(&self, tx: Self::Tx) {
        // The transaction rolls back server-side by timeout regardless.
        if let Err(e) = tx.rollback().await {
            warn!(error = %e, "rollback failed; relying on server-side timeout");
        }
    }

    #[instrument(skip(self), fields(key = %key), err)]
    async fn ledger_lookup(&self, key: &IdempotencyKey) -> ExecResult<Option<IdempotencyRecord>> {
        let row = sqlx::query(
            r#"
            SELECT key, response, created_at, expires_at
            FROM idempotency_ledger
            WHERE key = $1 AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("ledger_lookup", e))?;

        row.map(parse_record).transpose()
    }

    #[instrument(skip(self, tx, record), fields(key = %record.key), err)]
    async fn ledger_record(
        &self,
        tx: &mut Self::Tx,
        record: IdempotencyRecord,
    ) -> ExecResult<()> {
        let response = serde_json::to_value(&record.response)
            .map_err(|e| ExecError::unknown(format!("response serialization failed: {e}")))?;

        // An expired-but-unpurged row no longer guards anything and may be
        // replaced; a live row must stay untouched. Zero affected rows means
        // a live record already holds the key.
        let result = sqlx::query(
            r#"
            INSERT INTO idempotency_ledger (key, response, created_at, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (key) DO UPDATE
            SET response = EXCLUDED.response,
                created_at = EXCLUDED.created_at,
                expires_at = EXCLUDED.expires_at
            WHERE idempotency_ledger.expires_at <= NOW()
            "#,
        )
        .bind(record.key.as_str())
        .bind(&response)
        .bind(record.created_at)
        .bind(record.expires_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("ledger_record", e))?;

        if result.rows_affected() == 0 {
            return Err(ExecError::duplicate_key(record.key.as_str()));
        }

        Ok(())
    }
}

fn parse_record(row: sqlx::postgres::PgRow) -> ExecResult<IdempotencyRecord> {
    let key: String = row
        .try_get("key")
        .map_err(|e| ExecError::unknown(format!("failed to read ledger key: {e}")))?;
    let response: JsonValue = row
        .try_get("response")
        .map_err(|e| ExecError::unknown(format!("failed to read ledger response: {e}")))?;
    let created_at: DateTime<Utc> = row
        .try_get("created_at")
        .map_err(|e| ExecError::unknown(format!("failed to read created_at: {e}")))?;
    let expires_at: Option<DateTime<Utc>> = row
        .try_get("expires_at")
        .map_err(|e| ExecError::unknown(format!("failed to read expires_at: {e}")))?;

    let response: StoredResponse = serde_json::from_value(response)
        .map_err(|e| ExecError::unknown(format!("stored response deserialization failed: {e}")))?;

    Ok(IdempotencyRecord {
        key: IdempotencyKey::new(key)?,
        response,
        created_at,
        expires_at,
    })
}
