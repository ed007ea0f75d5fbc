//! Storage contracts consumed by the ledger engine.
//!
//! The engine needs a small, transactional capability set from storage:
//!
//! - Open a transaction, commit it, roll it back
//! - Insert a mutation record unless its idempotency key already exists
//! - Read an account, either under an exclusive lock or plainly with its version
//! - Write a new level, either unconditionally or as a version compare-and-set
//! - Settle the status of the record inserted in this transaction
//!
//! Provisioning and read-side queries live on [`AccountRepository`], which the
//! engine itself never touches.
//!
//! # Implementations
//!
//! - `PostgresStore` (in `quota-ledger-postgres`): row locks and `CHECK` constraints
//! - `InMemoryStore` (in `quota-ledger-testing`): per-account async mutexes, staged writes
//!
//! # Dyn Compatibility
//!
//! Methods return explicit `Pin<Box<dyn Future>>` instead of `async fn` so the
//! engine can hold `Arc<dyn ResourceStore>`.

use crate::error::StoreError;
use crate::types::{
    Account, AccountId, AccountSnapshot, IdempotencyKey, MutationRecord, MutationStatus,
};
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Result of [`StoreTx::insert_if_absent`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// This transaction now owns the freshly inserted record.
    Inserted,
    /// A record with the same idempotency key already exists.
    Existing(MutationRecord),
}

/// An open storage transaction.
///
/// Everything written through a `StoreTx` becomes visible atomically on
/// [`commit`](StoreTx::commit) or not at all. Dropping an uncommitted
/// transaction rolls it back and releases any locks it holds.
pub trait StoreTx: Send {
    /// Insert `record` unless a record with its idempotency key exists.
    ///
    /// If another open transaction is inserting the same key, this call waits
    /// for it to finish and then reports the outcome against the committed state.
    ///
    /// # Errors
    ///
    /// - `AccountNotFound`: The record references an unknown account
    /// - `Database`: Transport failure
    fn insert_if_absent<'a>(
        &'a mut self,
        record: &'a MutationRecord,
    ) -> StoreFuture<'a, InsertOutcome>;

    /// Read an account under an exclusive lock held until the transaction ends.
    ///
    /// Concurrent callers on the same account block here (bounded by the
    /// store's lock timeout).
    ///
    /// # Errors
    ///
    /// - `AccountNotFound`: No such account
    /// - `LockTimeout`: The lock was not acquired in time
    fn lock_and_read_account(&mut self, id: AccountId) -> StoreFuture<'_, AccountSnapshot>;

    /// Read an account without locking it.
    ///
    /// # Errors
    ///
    /// - `AccountNotFound`: No such account
    fn read_account(&mut self, id: AccountId) -> StoreFuture<'_, AccountSnapshot>;

    /// Overwrite the account level and bump its version.
    ///
    /// # Errors
    ///
    /// - `ConstraintViolation`: `new_level` is negative
    /// - `AccountNotFound`: No such account
    fn write_account_level(&mut self, id: AccountId, new_level: i64) -> StoreFuture<'_, ()>;

    /// Overwrite the account level only if its version is still `expected_version`.
    ///
    /// # Errors
    ///
    /// - `WriteConflict`: The version moved since it was read
    /// - `ConstraintViolation`: `new_level` is negative
    fn write_account_level_if_unchanged(
        &mut self,
        id: AccountId,
        expected_version: i64,
        new_level: i64,
    ) -> StoreFuture<'_, ()>;

    /// Set the status of the record with `key`.
    ///
    /// # Errors
    ///
    /// - `Corrupt`: No record with that key is visible to this transaction
    fn set_record_status<'a>(
        &'a mut self,
        key: &'a IdempotencyKey,
        status: MutationStatus,
    ) -> StoreFuture<'a, ()>;

    /// Make every write in this transaction visible and release its locks.
    ///
    /// # Errors
    ///
    /// - `WriteConflict`: A serialization check failed at commit time
    /// - `Database`: Commit failed; nothing was applied
    fn commit(self: Box<Self>) -> StoreFuture<'static, ()>;

    /// Discard every write in this transaction and release its locks.
    ///
    /// # Errors
    ///
    /// - `Database`: Transport failure while rolling back
    fn rollback(self: Box<Self>) -> StoreFuture<'static, ()>;
}

/// Transactional store the ledger engine mutates accounts through.
pub trait ResourceStore: Send + Sync {
    /// Open a new transaction.
    ///
    /// # Errors
    ///
    /// - `Database`: No connection could be acquired
    fn begin(&self) -> StoreFuture<'_, Box<dyn StoreTx>>;
}

/// Provisioning and read-side queries.
pub trait AccountRepository: Send + Sync {
    /// Persist a new account.
    ///
    /// # Errors
    ///
    /// - `AccountAlreadyExists`: The owner already has an account
    /// - `ConstraintViolation`: Negative initial level
    fn open_account(&self, account: Account) -> StoreFuture<'_, Account>;

    /// Look up an account.
    ///
    /// # Errors
    ///
    /// - `Database`: Transport failure
    fn get_account(&self, id: AccountId) -> StoreFuture<'_, Option<Account>>;

    /// Records for an account, newest first, at most `limit` of them.
    ///
    /// # Errors
    ///
    /// - `Database`: Transport failure
    fn list_records(&self, id: AccountId, limit: usize) -> StoreFuture<'_, Vec<MutationRecord>>;

    /// Look up a record by idempotency key.
    ///
    /// # Errors
    ///
    /// - `Database`: Transport failure
    fn find_record<'a>(
        &'a self,
        key: &'a IdempotencyKey,
    ) -> StoreFuture<'a, Option<MutationRecord>>;
}
