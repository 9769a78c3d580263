//! The idempotent operation executor.
//!
//! One reusable implementation of the guarded write path every mutating
//! handler shares: check the ledger, run the business operation and the
//! ledger write inside one unit of work, and retry transient failures under
//! an injected backoff policy. Replays under a known key are pure ledger
//! reads — the operation is never re-executed after a commit.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{debug, instrument, warn, Span};

use dwell_core::{ExecError, ExecResult, IdempotencyKey, RequestId, StoredResponse};

use crate::backoff::{BackoffPolicy, JitterSource, ThreadRngJitter};
use crate::store::{IdempotencyRecord, LedgerStore};
use crate::uow::UnitOfWork;

/// A caller-supplied unit of work over the store.
///
/// Side effects must go through the transaction handle; anything mutated
/// outside it is not covered by the atomicity guarantee. The returned
/// response is what the ledger persists and what replays of the same key
/// will answer with.
#[async_trait]
pub trait Operation<Tx: Send>: Send + Sync {
    async fn execute(&self, tx: &mut Tx) -> ExecResult<StoredResponse>;
}

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Name for logging.
    pub name: String,
    /// Expiry stamped on ledger records, if any. Expired records read as
    /// misses; purging them is an external housekeeping concern.
    pub ledger_ttl: Option<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            name: "op-executor".to_string(),
            ledger_ttl: None,
        }
    }
}

impl ExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_ledger_ttl(mut self, ttl: Duration) -> Self {
        self.ledger_ttl = Some(ttl);
        self
    }
}

/// Attempt bookkeeping for one executor invocation.
///
/// Attempts are 1-indexed; the context is created fresh per invocation and
/// discarded at the terminal outcome.
#[derive(Debug, Clone, Copy)]
pub struct RetryContext {
    attempt: u32,
    max_attempts: u32,
}

impl RetryContext {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            max_attempts,
        }
    }

    /// Count a new attempt and return its 1-indexed number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Idempotent transactional operation executor.
///
/// Holds no shared mutable state of its own; correctness rests on the
/// store's transactional isolation plus the ledger's uniqueness constraint,
/// so independent service instances may race on the same key safely.
pub struct Executor<S: LedgerStore> {
    store: S,
    config: ExecutorConfig,
    jitter: Arc<dyn JitterSource>,
}

impl<S: LedgerStore> Executor<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            config: ExecutorConfig::default(),
            jitter: Arc::new(ThreadRngJitter),
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the jitter source (tests pin delays with a fixed source).
    pub fn with_jitter(mut self, jitter: impl JitterSource + 'static) -> Self {
        self.jitter = Arc::new(jitter);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Execute `operation` at most once under `key`.
    ///
    /// - Empty key: immediate `InvalidKey`, no retry.
    /// - Ledger hit: the stored response, verbatim, with zero mutation.
    /// - Ledger miss: run the operation and the ledger write in one unit of
    ///   work, retrying transient failures per `policy`. A duplicate-key
    ///   failure means a concurrent attempt already won; its response is
    ///   replayed instead of retrying the business operation.
    ///
    /// The terminal error of a failed invocation is the last attempt's
    /// error, unchanged — never a retry history.
    #[instrument(
        skip_all,
        fields(
            executor = %self.config.name,
            key = %key,
            request_id = tracing::field::Empty,
        )
    )]
    pub async fn execute<O>(
        &self,
        key: &str,
        operation: &O,
        policy: &BackoffPolicy,
    ) -> ExecResult<StoredResponse>
    where
        O: Operation<S::Tx> + ?Sized,
    {
        let key = IdempotencyKey::new(key)?;
        let request_id = RequestId::new();
        Span::current().record("request_id", tracing::field::display(request_id));

        if let Some(hit) = self.store.ledger_lookup(&key).await? {
            debug!("ledger hit; replaying stored response");
            return Ok(hit.response);
        }

        let mut ctx = RetryContext::new(policy.max_attempts);
        loop {
            let attempt = ctx.begin_attempt();
            match self.attempt(&key, operation).await {
                Ok(response) => {
                    debug!(attempt, "operation committed");
                    return Ok(response);
                }
                Err(ExecError::DuplicateKey(_)) => {
                    debug!(attempt, "key already recorded; replaying the winner's response");
                    return self.replay_winner(&key).await;
                }
                Err(err) => {
                    if policy.should_retry(attempt, err.class()) {
                        let delay = policy.delay_for_attempt(attempt, self.jitter.as_ref());
                        warn!(
                            attempt,
                            max_attempts = ctx.max_attempts(),
                            error = %err,
                            delay_ms = delay.as_millis() as u64,
                            "transient failure; backing off before retry"
                        );
                        sleep(delay).await;
                    } else {
                        return Err(err);
                    }
                }
            }
        }
    }

    /// One attempt: operation plus ledger write in a single unit of work.
    async fn attempt<O>(&self, key: &IdempotencyKey, operation: &O) -> ExecResult<StoredResponse>
    where
        O: Operation<S::Tx> + ?Sized,
    {
        let mut uow = UnitOfWork::begin(&self.store).await?;
        uow.run(async |tx| {
            let response = operation.execute(tx).await?;
            let mut record = IdempotencyRecord::new(key.clone(), response.clone());
            if let Some(ttl) = self.config.ledger_ttl {
                record = record.with_ttl(ttl);
            }
            self.store.ledger_record(tx, record).await?;
            Ok(response)
        })
        .await
    }

    /// A concurrent attempt committed first; answer with its response.
    async fn replay_winner(&self, key: &IdempotencyKey) -> ExecResult<StoredResponse> {
        match self.store.ledger_lookup(key).await? {
            Some(record) => Ok(record.response),
            // The winner's record expired between its commit and our lookup.
            // Re-running the operation could double-apply its mutation, so
            // surface a conflict instead.
            None => Err(ExecError::conflict(format!(
                "idempotency key {key} was committed concurrently but its record is gone"
            ))),
        }
    }
}
