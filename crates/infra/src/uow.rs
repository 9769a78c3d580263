//! Transactional unit of work.
//!
//! Wraps one store transaction handle in an explicit
//! `Open -> {Committed, Aborted}` state machine. The handle is released on
//! every exit path: commit and abort consume it, and dropping an open unit
//! lets the store's handle discard its staged writes (Postgres rolls a
//! dropped transaction back; the in-memory handle simply drops its staging
//! buffers).

use tracing::debug;

use dwell_core::{ExecError, ExecResult};

use crate::store::LedgerStore;

/// Lifecycle state of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UowState {
    Open,
    Committed,
    Aborted,
}

/// One atomic commit/abort boundary over a [`LedgerStore`] transaction.
///
/// Either every write staged through [`UnitOfWork::tx`] becomes visible, or
/// none does — and the paired ledger record is only ever visible together
/// with the mutations it guards.
pub struct UnitOfWork<'s, S: LedgerStore> {
    store: &'s S,
    tx: Option<S::Tx>,
    state: UowState,
}

impl<'s, S: LedgerStore> UnitOfWork<'s, S> {
    /// Acquire a transaction handle and open a unit of work.
    pub async fn begin(store: &'s S) -> ExecResult<Self> {
        let tx = store.begin().await?;
        Ok(Self {
            store,
            tx: Some(tx),
            state: UowState::Open,
        })
    }

    pub fn state(&self) -> UowState {
        self.state
    }

    /// The underlying transaction handle.
    ///
    /// Fails once the unit has committed or aborted.
    pub fn tx(&mut self) -> ExecResult<&mut S::Tx> {
        if self.state != UowState::Open {
            return Err(ExecError::unknown("unit of work is no longer open"));
        }
        self.tx
            .as_mut()
            .ok_or_else(|| ExecError::unknown("unit of work has no transaction handle"))
    }

    /// Execute `body` against the transaction handle; commit on success,
    /// abort on failure.
    ///
    /// The body's error (or the commit error) propagates unchanged.
    pub async fn run<T, F>(&mut self, body: F) -> ExecResult<T>
    where
        F: AsyncFnOnce(&mut S::Tx) -> ExecResult<T>,
    {
        let result = {
            let tx = self.tx()?;
            body(tx).await
        };

        match result {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(err) => {
                self.abort().await;
                Err(err)
            }
        }
    }

    /// Durably apply all staged writes, atomically.
    ///
    /// On failure the unit transitions to `Aborted`; the handle is consumed
    /// either way.
    pub async fn commit(&mut self) -> ExecResult<()> {
        if self.state != UowState::Open {
            return Err(ExecError::unknown("unit of work is no longer open"));
        }
        let tx = self
            .tx
            .take()
            .ok_or_else(|| ExecError::unknown("unit of work has no transaction handle"))?;

        match self.store.commit(tx).await {
            Ok(()) => {
                self.state = UowState::Committed;
                Ok(())
            }
            Err(err) => {
                self.state = UowState::Aborted;
                Err(err)
            }
        }
    }

    /// Discard all staged writes. Always succeeds; a no-op once terminal.
    pub async fn abort(&mut self) {
        if self.state != UowState::Open {
            return;
        }
        if let Some(tx) = self.tx.take() {
            self.store.abort(tx).await;
        }
        self.state = UowState::Aborted;
    }
}

impl<S: LedgerStore> Drop for UnitOfWork<'_, S> {
    fn drop(&mut self) {
        if self.state == UowState::Open {
            debug!("unit of work dropped while open; staged writes discarded by the store");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{IdempotencyRecord, InMemoryStore};
    use dwell_core::{IdempotencyKey, StoredResponse};
    use serde_json::json;

    fn record(raw: &str) -> IdempotencyRecord {
        IdempotencyRecord::new(
            IdempotencyKey::new(raw).unwrap(),
            StoredResponse::created(json!({"data": "Created"})),
        )
    }

    #[tokio::test]
    async fn run_commits_on_success() {
        let store = InMemoryStore::new();
        let mut uow = UnitOfWork::begin(&store).await.unwrap();

        let value = uow
            .run(async |tx| {
                tx.put_document("listing-1", json!({"name": "Sunny Villa"}));
                store.ledger_record(tx, record("txn-1")).await?;
                Ok(7)
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(uow.state(), UowState::Committed);
        assert_eq!(store.document_count(), 1);
        assert_eq!(store.ledger_len(), 1);
    }

    #[tokio::test]
    async fn run_aborts_on_body_error() {
        let store = InMemoryStore::new();
        let mut uow = UnitOfWork::begin(&store).await.unwrap();

        let err = uow
            .run(async |tx| -> dwell_core::ExecResult<()> {
                tx.put_document("listing-1", json!({}));
                Err(dwell_core::ExecError::validation("price must be positive"))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ExecError::Validation(_)));
        assert_eq!(uow.state(), UowState::Aborted);
        assert_eq!(store.document_count(), 0);
    }

    #[tokio::test]
    async fn commit_is_terminal() {
        let store = InMemoryStore::new();
        let mut uow = UnitOfWork::begin(&store).await.unwrap();

        uow.commit().await.unwrap();
        assert!(uow.commit().await.is_err());
        assert!(uow.tx().is_err());

        // Abort after commit is a no-op, not a state change.
        uow.abort().await;
        assert_eq!(uow.state(), UowState::Committed);
    }

    #[tokio::test]
    async fn dropping_open_unit_discards_writes() {
        let store = InMemoryStore::new();
        {
            let mut uow = UnitOfWork::begin(&store).await.unwrap();
            uow.tx().unwrap().put_document("listing-1", json!({}));
        }
        assert_eq!(store.document_count(), 0);
    }
}
