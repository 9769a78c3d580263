//! In-memory ledger store.
//!
//! Intended for tests/dev. Staged writes live on the transaction handle and
//! reach shared state only at commit, under one write lock, so commit is
//! atomic and concurrent committers serialize. Scriptable faults let tests
//! drive the retry paths without a real database.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::debug;

use dwell_core::{ExecError, ExecResult, IdempotencyKey};

use super::{IdempotencyRecord, LedgerStore};

/// Scripted failure, consumed in FIFO order at the matching point.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Fail the next `begin` with this error.
    Begin(ExecError),
    /// Fail the next `commit` with this error; staged writes are discarded.
    Commit(ExecError),
}

#[derive(Debug, Default)]
struct State {
    ledger: HashMap<String, IdempotencyRecord>,
    documents: HashMap<String, JsonValue>,
}

/// In-memory transactional store with a co-located idempotency ledger.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
    faults: Mutex<VecDeque<Fault>>,
}

/// Staged writes for one in-memory transaction.
#[derive(Debug, Default)]
pub struct MemTx {
    ledger: Vec<IdempotencyRecord>,
    writes: Vec<DocWrite>,
}

#[derive(Debug)]
enum DocWrite {
    Put(String, JsonValue),
    Delete(String),
}

impl MemTx {
    /// Stage an upsert of a business document.
    pub fn put_document(&mut self, id: impl Into<String>, value: JsonValue) {
        self.writes.push(DocWrite::Put(id.into(), value));
    }

    /// Stage a delete of a business document.
    pub fn delete_document(&mut self, id: impl Into<String>) {
        self.writes.push(DocWrite::Delete(id.into()));
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a scripted failure.
    pub fn inject_fault(&self, fault: Fault) {
        self.faults.lock().unwrap().push_back(fault);
    }

    /// Committed document by id.
    pub fn document(&self, id: &str) -> Option<JsonValue> {
        self.state.read().unwrap().documents.get(id).cloned()
    }

    /// Number of committed business documents.
    pub fn document_count(&self) -> usize {
        self.state.read().unwrap().documents.len()
    }

    /// Number of committed ledger records, expired ones included.
    pub fn ledger_len(&self) -> usize {
        self.state.read().unwrap().ledger.len()
    }

    fn take_fault(&self, want_begin: bool) -> Option<ExecError> {
        let mut faults = self.faults.lock().unwrap();
        match faults.front() {
            Some(Fault::Begin(_)) if want_begin => match faults.pop_front() {
                Some(Fault::Begin(err)) => Some(err),
                _ => None,
            },
            Some(Fault::Commit(_)) if !want_begin => match faults.pop_front() {
                Some(Fault::Commit(err)) => Some(err),
                _ => None,
            },
            _ => None,
        }
    }
}

#[async_trait]
impl LedgerStore for InMemoryStore {
    type Tx = MemTx;

    async fn begin(&self) -> ExecResult<MemTx> {
        if let Some(err) = self.take_fault(true) {
            return Err(err);
        }
        Ok(MemTx::default())
    }

    async fn commit(&self, tx: MemTx) -> ExecResult<()> {
        if let Some(err) = self.take_fault(false) {
            return Err(err);
        }

        let mut state = self
            .state
            .write()
            .map_err(|_| ExecError::storage_unavailable("state lock poisoned"))?;

        // Uniqueness check first so the commit stays all-or-nothing.
        let now = Utc::now();
        for record in &tx.ledger {
            if let Some(existing) = state.ledger.get(record.key.as_str()) {
                if !existing.is_expired(now) {
                    return Err(ExecError::duplicate_key(record.key.as_str()));
                }
            }
        }

        for write in tx.writes {
            match write {
                DocWrite::Put(id, value) => {
                    state.documents.insert(id, value);
                }
                DocWrite::Delete(id) => {
                    state.documents.remove(&id);
                }
            }
        }
        for record in tx.ledger {
            state.ledger.insert(record.key.as_str().to_string(), record);
        }

        Ok(())
    }

    async fn abort(&self, tx: MemTx) {
        debug!(
            staged_writes = tx.writes.len(),
            staged_records = tx.ledger.len(),
            "aborting in-memory transaction"
        );
        drop(tx);
    }

    async fn ledger_lookup(&self, key: &IdempotencyKey) -> ExecResult<Option<IdempotencyRecord>> {
        let state = self
            .state
            .read()
            .map_err(|_| ExecError::storage_unavailable("state lock poisoned"))?;

        let record = state.ledger.get(key.as_str());
        Ok(record
            .filter(|r| !r.is_expired(Utc::now()))
            .cloned())
    }

    async fn ledger_record(&self, tx: &mut MemTx, record: IdempotencyRecord) -> ExecResult<()> {
        let state = self
            .state
            .read()
            .map_err(|_| ExecError::storage_unavailable("state lock poisoned"))?;

        let now = Utc::now();
        if let Some(existing) = state.ledger.get(record.key.as_str()) {
            if !existing.is_expired(now) {
                return Err(ExecError::duplicate_key(record.key.as_str()));
            }
        }
        if tx.ledger.iter().any(|r| r.key == record.key) {
            return Err(ExecError::duplicate_key(record.key.as_str()));
        }

        tx.ledger.push(record);
        Ok(())
    }
}
