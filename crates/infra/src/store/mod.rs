//! Ledger-backed transactional storage.
//!
//! The [`LedgerStore`] trait is the seam between the executor and a concrete
//! database: it hands out transaction handles and persists the idempotency
//! ledger inside them. `in_memory` backs tests and development; `postgres` is
//! the durable implementation.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use dwell_core::{ExecResult, IdempotencyKey, StoredResponse};

pub use in_memory::{Fault, InMemoryStore, MemTx};
pub use postgres::PostgresLedgerStore;

/// Durable mapping from idempotency key to the previously-computed response.
///
/// At most one record per key ever exists; once committed it is immutable.
/// Records may expire (`expires_at`), after which a lookup treats them as
/// absent and garbage collection may purge them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyRecord {
    pub key: IdempotencyKey,
    pub response: StoredResponse,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl IdempotencyRecord {
    pub fn new(key: IdempotencyKey, response: StoredResponse) -> Self {
        Self {
            key,
            response,
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    /// Stamp an expiry `ttl` from the record's creation time.
    ///
    /// A ttl too large to represent leaves the record without an expiry
    /// rather than producing one that is already in the past.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| self.created_at.checked_add_signed(ttl));
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Transactional store with a co-located idempotency ledger.
///
/// Implementations must guarantee:
/// - `begin` hands out an isolated transaction handle, or fails with
///   `StorageUnavailable`;
/// - writes staged through a handle become visible only at `commit`, all or
///   nothing;
/// - `commit` fails with `TransactionConflict` on write-conflict /
///   serialization failure and with `DuplicateKey` when a concurrently
///   committed ledger record holds the same key;
/// - `ledger_record` enforces key uniqueness against committed state and
///   fails with `DuplicateKey` (the caller falls back to `ledger_lookup`);
/// - `abort` is best-effort: infrastructure failures are logged, not
///   surfaced, since an unreachable transaction rolls back by timeout anyway.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Transaction handle; mutations issued through it are staged until
    /// commit. Dropping a handle without committing must discard its writes.
    type Tx: Send;

    /// Acquire a transaction handle.
    async fn begin(&self) -> ExecResult<Self::Tx>;

    /// Durably apply every write staged in `tx`, atomically.
    async fn commit(&self, tx: Self::Tx) -> ExecResult<()>;

    /// Discard every write staged in `tx`. Best-effort.
    async fn abort(&self, tx: Self::Tx);

    /// Fetch the live ledger record for `key`.
    ///
    /// A miss (or an expired record) is `Ok(None)`; `Err` means the store
    /// itself failed.
    async fn ledger_lookup(&self, key: &IdempotencyKey) -> ExecResult<Option<IdempotencyRecord>>;

    /// Stage the ledger record inside `tx`.
    ///
    /// Visible only if the enclosing transaction commits. Fails with
    /// `DuplicateKey` when the key already has a committed record.
    async fn ledger_record(&self, tx: &mut Self::Tx, record: IdempotencyRecord) -> ExecResult<()>;
}

#[async_trait]
impl<S> LedgerStore for Arc<S>
where
    S: LedgerStore + ?Sized,
{
    type Tx = S::Tx;

    async fn begin(&self) -> ExecResult<Self::Tx> {
        (**self).begin().await
    }

    async fn commit(&self, tx: Self::Tx) -> ExecResult<()> {
        (**self).commit(tx).await
    }

    async fn abort(&self, tx: Self::Tx) {
        (**self).abort(tx).await
    }

    async fn ledger_lookup(&self, key: &IdempotencyKey) -> ExecResult<Option<IdempotencyRecord>> {
        (**self).ledger_lookup(key).await
    }

    async fn ledger_record(&self, tx: &mut Self::Tx, record: IdempotencyRecord) -> ExecResult<()> {
        (**self).ledger_record(tx, record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Contract every [`LedgerStore`] must honor: an expired record reads as
    /// a miss and no longer blocks a fresh write for the same key.
    ///
    /// Runs against the in-memory store here; the Postgres implementation
    /// satisfies it via its expire-aware upsert.
    async fn assert_expired_record_is_replaceable<S: LedgerStore>(store: &S) {
        let key = IdempotencyKey::new("txn-ttl").unwrap();

        let mut tx = store.begin().await.unwrap();
        let expired = IdempotencyRecord::new(
            key.clone(),
            StoredResponse::created(json!({"data": "stale"})),
        )
        .with_ttl(Duration::ZERO);
        store.ledger_record(&mut tx, expired).await.unwrap();
        store.commit(tx).await.unwrap();

        assert!(store.ledger_lookup(&key).await.unwrap().is_none());

        let mut tx = store.begin().await.unwrap();
        let fresh = IdempotencyRecord::new(
            key.clone(),
            StoredResponse::created(json!({"data": "fresh"})),
        );
        store.ledger_record(&mut tx, fresh).await.unwrap();
        store.commit(tx).await.unwrap();

        let replay = store.ledger_lookup(&key).await.unwrap().unwrap();
        assert_eq!(replay.response.body, json!({"data": "fresh"}));
    }

    #[tokio::test]
    async fn in_memory_store_replaces_expired_records() {
        assert_expired_record_is_replaceable(&InMemoryStore::new()).await;
    }

    #[test]
    fn record_expiry() {
        let key = IdempotencyKey::new("txn-1").unwrap();
        let record = IdempotencyRecord::new(key, StoredResponse::created(json!({"data": "Created"})));

        assert!(!record.is_expired(Utc::now()));

        let record = record.with_ttl(Duration::from_secs(60));
        assert!(!record.is_expired(record.created_at));
        assert!(record.is_expired(record.created_at + chrono::Duration::seconds(61)));
    }

    #[test]
    fn unrepresentable_ttl_means_no_expiry() {
        let key = IdempotencyKey::new("txn-1").unwrap();
        let record = IdempotencyRecord::new(key, StoredResponse::no_content())
            .with_ttl(Duration::MAX);

        assert!(record.expires_at.is_none());
        assert!(!record.is_expired(Utc::now()));
    }
}
