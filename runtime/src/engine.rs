//! The ledger engine.
//!
//! One [`LedgerEngine::apply`] call is one all-or-nothing attempt:
//!
//! 1. Begin a transaction
//! 2. Insert a `PENDING` record unless the idempotency key already exists
//!    (an existing record is returned as-is and nothing else happens)
//! 3. Read the account, under an exclusive lock or by version depending on
//!    the [`LockingStrategy`]
//! 4. Enforce the kind's invariant against the level just read
//! 5. Write the new level (unconditionally, or as a version compare-and-set)
//! 6. Mark the record `SUCCEEDED` and commit
//!
//! Any failure after step 1 rolls the transaction back, so a rejected or
//! conflicting attempt leaves neither a record nor a level change behind.
//! [`LedgerEngine::apply_with_retry`] wraps the attempt in the jittered
//! retry loop from [`crate::retry`].

use crate::metrics::LedgerMetrics;
use crate::retry::{RetryError, RetryPolicy, retry_with_jitter};
use quota_ledger_core::classifier::classify_request;
use quota_ledger_core::environment::Clock;
use quota_ledger_core::error::{LedgerError, StoreError};
use quota_ledger_core::store::{InsertOutcome, ResourceStore, StoreTx};
use quota_ledger_core::types::{
    AccountId, AccountSnapshot, Amount, IdempotencyKey, Mutation, MutationKind, MutationRecord,
    MutationRequest, MutationStatus, RecordId,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// How an attempt protects the account row against concurrent writers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockingStrategy {
    /// Lock the row before reading it; concurrent attempts queue on the lock.
    #[default]
    Pessimistic,
    /// Read without locking and write with a version compare-and-set;
    /// the loser of a race gets `WriteConflict`.
    Optimistic,
}

impl LockingStrategy {
    /// Config representation
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pessimistic => "pessimistic",
            Self::Optimistic => "optimistic",
        }
    }
}

/// An unrecognized strategy name.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown locking strategy {0:?}, must be pessimistic or optimistic")]
pub struct ParseStrategyError(String);

impl FromStr for LockingStrategy {
    type Err = ParseStrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pessimistic" => Ok(Self::Pessimistic),
            "optimistic" => Ok(Self::Optimistic),
            other => Err(ParseStrategyError(other.to_string())),
        }
    }
}

impl fmt::Display for LockingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineConfig {
    /// Concurrency strategy for every attempt
    pub strategy: LockingStrategy,
    /// Policy used by [`LedgerEngine::submit`]
    pub retry: RetryPolicy,
}

impl EngineConfig {
    /// Create a config with the given strategy and the default retry policy.
    #[must_use]
    pub fn with_strategy(strategy: LockingStrategy) -> Self {
        Self {
            strategy,
            retry: RetryPolicy::default(),
        }
    }

    /// Replace the retry policy.
    #[must_use]
    pub const fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

enum Settled {
    Applied(MutationRecord),
    Replayed(MutationRecord),
}

/// Applies mutations to accounts through a [`ResourceStore`].
///
/// Cheap to clone; holds no mutable state of its own.
#[derive(Clone)]
pub struct LedgerEngine {
    store: Arc<dyn ResourceStore>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl LedgerEngine {
    /// Create an engine over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn ResourceStore>, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Engine configuration
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run one attempt to apply `delta` to an account.
    ///
    /// Calling again with the same `idempotency_key` returns the stored record
    /// without touching the level.
    ///
    /// # Errors
    ///
    /// - `InvalidAmount`: `delta <= 0`, or the new level would overflow
    /// - `InvalidIdempotencyKey`: Empty or longer than 255 bytes
    /// - `InsufficientResource`: A decrease exceeds the current level
    /// - `AccountNotFound`: No such account
    /// - `WriteConflict` / `LockTimeout`: Lost a race; safe to retry
    /// - `Store`: Transport failure
    pub async fn apply(
        &self,
        account_id: AccountId,
        idempotency_key: &str,
        delta: i64,
        kind: MutationKind,
    ) -> Result<MutationRecord, LedgerError> {
        let mutation = validate(account_id, idempotency_key, delta, kind)?;
        self.apply_mutation(&mutation).await
    }

    /// Run one attempt for an already validated mutation.
    ///
    /// # Errors
    ///
    /// Same as [`apply`](Self::apply), minus the input validation errors.
    #[tracing::instrument(
        skip_all,
        name = "ledger_apply",
        fields(
            account_id = %mutation.account_id,
            idempotency_key = %mutation.idempotency_key,
            kind = mutation.kind.as_str(),
            delta = mutation.signed_delta(),
            strategy = self.config.strategy.as_str(),
        )
    )]
    pub async fn apply_mutation(&self, mutation: &Mutation) -> Result<MutationRecord, LedgerError> {
        let start = Instant::now();
        let result = self.attempt(mutation).await;

        let outcome = match &result {
            Ok(Settled::Applied(_)) => "succeeded",
            Ok(Settled::Replayed(_)) => "replayed",
            Err(err) => err.code(),
        };
        LedgerMetrics::record_outcome(outcome, start.elapsed());

        result.map(|settled| match settled {
            Settled::Applied(record) | Settled::Replayed(record) => record,
        })
    }

    /// Apply with retries on `WriteConflict` and `LockTimeout`.
    ///
    /// # Errors
    ///
    /// - `RetriesExhausted`: Every attempt hit contention
    /// - Any non-retryable error from [`apply`](Self::apply), returned immediately
    pub async fn apply_with_retry(
        &self,
        account_id: AccountId,
        idempotency_key: &str,
        delta: i64,
        kind: MutationKind,
        policy: &RetryPolicy,
    ) -> Result<MutationRecord, LedgerError> {
        let mutation = validate(account_id, idempotency_key, delta, kind)?;
        self.apply_mutation_with_retry(&mutation, policy).await
    }

    /// [`apply_with_retry`](Self::apply_with_retry) for an already validated mutation.
    ///
    /// # Errors
    ///
    /// Same as [`apply_with_retry`](Self::apply_with_retry).
    pub async fn apply_mutation_with_retry(
        &self,
        mutation: &Mutation,
        policy: &RetryPolicy,
    ) -> Result<MutationRecord, LedgerError> {
        retry_with_jitter(policy, || self.apply_mutation(mutation), LedgerError::is_retryable)
            .await
            .map_err(|err| match err {
                RetryError::Aborted(err) => err,
                RetryError::Exhausted { attempts, last } => LedgerError::RetriesExhausted {
                    attempts,
                    last: Box::new(last),
                },
            })
    }

    /// Classify a raw request and apply it with the configured retry policy.
    ///
    /// # Errors
    ///
    /// - `InvalidIntent`, `InvalidAmount`, `InvalidIdempotencyKey`: Rejected before any store call
    /// - Anything [`apply_with_retry`](Self::apply_with_retry) returns
    pub async fn submit(&self, request: &MutationRequest) -> Result<MutationRecord, LedgerError> {
        let mutation = classify_request(request)?;
        self.apply_mutation_with_retry(&mutation, &self.config.retry).await
    }

    async fn attempt(&self, mutation: &Mutation) -> Result<Settled, LedgerError> {
        let account_id = mutation.account_id;
        let mut tx = self.store.begin().await?;

        let pending = MutationRecord::pending(RecordId::new(), mutation, self.clock.now());
        if let InsertOutcome::Existing(existing) = tx.insert_if_absent(&pending).await? {
            tx.rollback().await?;
            if !existing.matches(mutation) {
                tracing::warn!(
                    stored_account_id = %existing.account_id,
                    stored_delta = existing.delta,
                    "Idempotency key reused with a different payload, returning stored record"
                );
            }
            tracing::debug!(status = existing.status.as_str(), "Replayed existing record");
            LedgerMetrics::record_replay();
            return Ok(Settled::Replayed(existing));
        }

        let snapshot = match self.config.strategy {
            LockingStrategy::Pessimistic => tx.lock_and_read_account(account_id).await?,
            LockingStrategy::Optimistic => tx.read_account(account_id).await?,
        };

        if let Err(err) = mutation.kind.invariant().check(&snapshot, mutation.amount) {
            return Err(abort(tx, err).await);
        }

        let Some(new_level) = mutation.kind.apply(snapshot.level, mutation.amount) else {
            return Err(abort(tx, LedgerError::InvalidAmount(mutation.amount.get())).await);
        };

        let written = match self.config.strategy {
            LockingStrategy::Pessimistic => tx.write_account_level(account_id, new_level).await,
            LockingStrategy::Optimistic => {
                tx.write_account_level_if_unchanged(account_id, snapshot.version, new_level)
                    .await
            },
        };
        if let Err(err) = written {
            let err = lift_write_error(err, &snapshot, mutation.amount);
            return Err(abort(tx, err).await);
        }

        tx.set_record_status(&mutation.idempotency_key, MutationStatus::Succeeded)
            .await?;
        tx.commit().await?;

        tracing::info!(
            level_before = snapshot.level,
            level_after = new_level,
            "Mutation committed"
        );
        Ok(Settled::Applied(pending.with_status(MutationStatus::Succeeded)))
    }
}

impl fmt::Debug for LedgerEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn validate(
    account_id: AccountId,
    idempotency_key: &str,
    delta: i64,
    kind: MutationKind,
) -> Result<Mutation, LedgerError> {
    let amount = Amount::new(delta)?;
    let key = IdempotencyKey::parse(idempotency_key)?;
    Ok(Mutation::new(account_id, key, amount, kind))
}

/// A `CHECK (level >= 0)` rejection means some writer moved the level under us.
fn lift_write_error(err: StoreError, snapshot: &AccountSnapshot, amount: Amount) -> LedgerError {
    match err {
        StoreError::ConstraintViolation(_) => LedgerError::InsufficientResource {
            account_id: snapshot.account_id,
            level: snapshot.level,
            requested: amount.get(),
        },
        other => other.into(),
    }
}

async fn abort(tx: Box<dyn StoreTx>, err: LedgerError) -> LedgerError {
    if let Err(rollback_err) = tx.rollback().await {
        tracing::warn!(error = %rollback_err, "Rollback failed, transaction dropped");
    }
    tracing::debug!(error = %err, "Attempt rolled back");
    err
}
