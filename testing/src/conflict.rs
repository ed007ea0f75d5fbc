//! Fault injection for retry tests.

use quota_ledger_core::error::StoreError;
use quota_ledger_core::store::{InsertOutcome, ResourceStore, StoreFuture, StoreTx};
use quota_ledger_core::types::{AccountId, AccountSnapshot, IdempotencyKey, MutationRecord, MutationStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Wraps a store and fails the next `n` level writes with `WriteConflict`.
///
/// Everything else is delegated, so a failed attempt rolls back exactly like
/// a real lost race would.
///
/// # Example
///
/// ```
/// use quota_ledger_testing::{ConflictInjectingStore, InMemoryStore};
/// use std::sync::Arc;
///
/// let store = ConflictInjectingStore::new(Arc::new(InMemoryStore::new()), 2);
/// assert_eq!(store.remaining(), 2);
/// ```
#[derive(Clone)]
pub struct ConflictInjectingStore {
    inner: Arc<dyn ResourceStore>,
    remaining: Arc<AtomicU32>,
    injected: Arc<AtomicU32>,
    begun: Arc<AtomicU32>,
}

impl ConflictInjectingStore {
    /// Wrap `inner`, failing its next `failures` level writes.
    #[must_use]
    pub fn new(inner: Arc<dyn ResourceStore>, failures: u32) -> Self {
        Self {
            inner,
            remaining: Arc::new(AtomicU32::new(failures)),
            injected: Arc::new(AtomicU32::new(0)),
            begun: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Arm `failures` more conflicts.
    pub fn fail_next(&self, failures: u32) {
        self.remaining.store(failures, Ordering::SeqCst);
    }

    /// Conflicts still armed
    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.remaining.load(Ordering::SeqCst)
    }

    /// Conflicts injected so far
    #[must_use]
    pub fn injected(&self) -> u32 {
        self.injected.load(Ordering::SeqCst)
    }

    /// Transactions opened so far
    #[must_use]
    pub fn transactions(&self) -> u32 {
        self.begun.load(Ordering::SeqCst)
    }
}

impl ResourceStore for ConflictInjectingStore {
    fn begin(&self) -> StoreFuture<'_, Box<dyn StoreTx>> {
        Box::pin(async move {
            self.begun.fetch_add(1, Ordering::SeqCst);
            let inner = self.inner.begin().await?;
            Ok(Box::new(ConflictTx {
                inner,
                remaining: Arc::clone(&self.remaining),
                injected: Arc::clone(&self.injected),
            }) as Box<dyn StoreTx>)
        })
    }
}

struct ConflictTx {
    inner: Box<dyn StoreTx>,
    remaining: Arc<AtomicU32>,
    injected: Arc<AtomicU32>,
}

impl ConflictTx {
    fn take_conflict(&self, id: AccountId) -> Result<(), StoreError> {
        let armed = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            let n = self.injected.fetch_add(1, Ordering::SeqCst) + 1;
            return Err(StoreError::WriteConflict(format!(
                "injected conflict #{n} on account {id}"
            )));
        }
        Ok(())
    }
}

impl StoreTx for ConflictTx {
    fn insert_if_absent<'a>(
        &'a mut self,
        record: &'a MutationRecord,
    ) -> StoreFuture<'a, InsertOutcome> {
        self.inner.insert_if_absent(record)
    }

    fn lock_and_read_account(&mut self, id: AccountId) -> StoreFuture<'_, AccountSnapshot> {
        self.inner.lock_and_read_account(id)
    }

    fn read_account(&mut self, id: AccountId) -> StoreFuture<'_, AccountSnapshot> {
        self.inner.read_account(id)
    }

    fn write_account_level(&mut self, id: AccountId, new_level: i64) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.take_conflict(id)?;
            self.inner.write_account_level(id, new_level).await
        })
    }

    fn write_account_level_if_unchanged(
        &mut self,
        id: AccountId,
        expected_version: i64,
        new_level: i64,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.take_conflict(id)?;
            self.inner
                .write_account_level_if_unchanged(id, expected_version, new_level)
                .await
        })
    }

    fn set_record_status<'a>(
        &'a mut self,
        key: &'a IdempotencyKey,
        status: MutationStatus,
    ) -> StoreFuture<'a, ()> {
        self.inner.set_record_status(key, status)
    }

    fn commit(self: Box<Self>) -> StoreFuture<'static, ()> {
        self.inner.commit()
    }

    fn rollback(self: Box<Self>) -> StoreFuture<'static, ()> {
        self.inner.rollback()
    }
}
