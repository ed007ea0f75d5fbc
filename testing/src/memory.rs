//! In-memory ledger storage for fast, deterministic tests.
//!
//! [`InMemoryStore`] implements both store contracts with the same
//! observable concurrency behavior as the PostgreSQL adapter:
//!
//! - `lock_and_read_account` takes a per-account async mutex held by the
//!   transaction until commit, rollback, or drop
//! - Inserts of the same idempotency key serialize; the second waits for the
//!   first transaction to finish, then sees its committed record
//! - Writes are staged and applied atomically on commit, after re-checking
//!   the version each staged write was based on
//! - A negative level is rejected as a constraint violation
//! - Lock waits are bounded by a timeout and fail with `LockTimeout`

use quota_ledger_core::error::StoreError;
use quota_ledger_core::store::{AccountRepository, InsertOutcome, ResourceStore, StoreFuture, StoreTx};
use quota_ledger_core::types::{
    Account, AccountId, AccountSnapshot, IdempotencyKey, MutationRecord, MutationStatus, OwnerId,
};
use quota_ledger_core::Utc;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

type LockTable<K> = Arc<Mutex<HashMap<K, Arc<AsyncMutex<()>>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn lock_handle<K: Eq + Hash + Clone>(table: &LockTable<K>, key: &K) -> Arc<AsyncMutex<()>> {
    Arc::clone(lock(table).entry(key.clone()).or_default())
}

async fn acquire(
    handle: Arc<AsyncMutex<()>>,
    timeout: Duration,
    what: impl FnOnce() -> String,
) -> Result<OwnedMutexGuard<()>, StoreError> {
    tokio::time::timeout(timeout, handle.lock_owned())
        .await
        .map_err(|_| StoreError::LockTimeout(format!("{} not acquired within {timeout:?}", what())))
}

#[derive(Debug, Default)]
struct Inner {
    accounts: HashMap<AccountId, Account>,
    owners: HashMap<OwnerId, AccountId>,
    /// Commit order
    records: Vec<MutationRecord>,
    by_key: HashMap<IdempotencyKey, usize>,
}

impl Inner {
    fn record(&self, key: &IdempotencyKey) -> Option<&MutationRecord> {
        self.by_key.get(key).and_then(|&idx| self.records.get(idx))
    }
}

/// In-memory implementation of [`ResourceStore`] and [`AccountRepository`].
///
/// Clones share state.
///
/// # Example
///
/// ```
/// use quota_ledger_testing::InMemoryStore;
///
/// let store = InMemoryStore::new();
/// let account = store.seed_account(100);
/// assert_eq!(store.level_of(account), Some(100));
/// ```
#[derive(Clone, Debug)]
pub struct InMemoryStore {
    inner: Arc<Mutex<Inner>>,
    account_locks: LockTable<AccountId>,
    key_locks: LockTable<IdempotencyKey>,
    lock_timeout: Duration,
}

impl InMemoryStore {
    /// Create an empty store with a 5 second lock timeout.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::default(),
            account_locks: Arc::default(),
            key_locks: Arc::default(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Bound how long a transaction waits for a row or key lock.
    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Insert an account with a random owner directly, bypassing transactions.
    pub fn seed_account(&self, level: i64) -> AccountId {
        let account = Account::open(OwnerId::new(), level, Utc::now());
        let id = account.id;
        let mut inner = lock(&self.inner);
        inner.owners.insert(account.owner_id, id);
        inner.accounts.insert(id, account);
        id
    }

    /// Committed level of an account.
    #[must_use]
    pub fn level_of(&self, id: AccountId) -> Option<i64> {
        lock(&self.inner).accounts.get(&id).map(|a| a.level)
    }

    /// Committed version of an account.
    #[must_use]
    pub fn version_of(&self, id: AccountId) -> Option<i64> {
        lock(&self.inner).accounts.get(&id).map(|a| a.version)
    }

    /// All committed records in commit order.
    #[must_use]
    pub fn records(&self) -> Vec<MutationRecord> {
        lock(&self.inner).records.clone()
    }

    /// Committed record with `key`.
    #[must_use]
    pub fn record(&self, key: &str) -> Option<MutationRecord> {
        let key = IdempotencyKey::parse(key).ok()?;
        lock(&self.inner).record(&key).cloned()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceStore for InMemoryStore {
    fn begin(&self) -> StoreFuture<'_, Box<dyn StoreTx>> {
        let tx = InMemoryTx {
            store: self.clone(),
            key_guards: Vec::new(),
            account_guards: HashMap::new(),
            staged_record: None,
            staged_levels: HashMap::new(),
        };
        Box::pin(async move { Ok(Box::new(tx) as Box<dyn StoreTx>) })
    }
}

impl AccountRepository for InMemoryStore {
    fn open_account(&self, account: Account) -> StoreFuture<'_, Account> {
        Box::pin(async move {
            if account.level < 0 {
                return Err(StoreError::ConstraintViolation(format!(
                    "level must be non-negative, got {}",
                    account.level
                )));
            }
            let mut inner = lock(&self.inner);
            if inner.owners.contains_key(&account.owner_id) {
                return Err(StoreError::AccountAlreadyExists(account.owner_id));
            }
            inner.owners.insert(account.owner_id, account.id);
            inner.accounts.insert(account.id, account.clone());
            Ok(account)
        })
    }

    fn get_account(&self, id: AccountId) -> StoreFuture<'_, Option<Account>> {
        Box::pin(async move { Ok(lock(&self.inner).accounts.get(&id).cloned()) })
    }

    fn list_records(&self, id: AccountId, limit: usize) -> StoreFuture<'_, Vec<MutationRecord>> {
        Box::pin(async move {
            Ok(lock(&self.inner)
                .records
                .iter()
                .rev()
                .filter(|r| r.account_id == id)
                .take(limit)
                .cloned()
                .collect())
        })
    }

    fn find_record<'a>(
        &'a self,
        key: &'a IdempotencyKey,
    ) -> StoreFuture<'a, Option<MutationRecord>> {
        Box::pin(async move { Ok(lock(&self.inner).record(key).cloned()) })
    }
}

#[derive(Debug, Clone, Copy)]
struct StagedLevel {
    level: i64,
    /// Version the write was based on, re-checked at commit
    base_version: i64,
}

struct InMemoryTx {
    store: InMemoryStore,
    key_guards: Vec<OwnedMutexGuard<()>>,
    account_guards: HashMap<AccountId, OwnedMutexGuard<()>>,
    staged_record: Option<MutationRecord>,
    staged_levels: HashMap<AccountId, StagedLevel>,
}

impl InMemoryTx {
    fn snapshot(&self, id: AccountId) -> Result<AccountSnapshot, StoreError> {
        let inner = lock(&self.store.inner);
        let account = inner.accounts.get(&id).ok_or(StoreError::AccountNotFound(id))?;
        let level = self
            .staged_levels
            .get(&id)
            .map_or(account.level, |staged| staged.level);
        Ok(AccountSnapshot {
            account_id: id,
            level,
            version: account.version,
        })
    }

    fn stage_level(
        &mut self,
        id: AccountId,
        expected_version: Option<i64>,
        new_level: i64,
    ) -> Result<(), StoreError> {
        if new_level < 0 {
            return Err(StoreError::ConstraintViolation(format!(
                "level must be non-negative, got {new_level}"
            )));
        }
        let current = {
            let inner = lock(&self.store.inner);
            inner
                .accounts
                .get(&id)
                .map(|a| a.version)
                .ok_or(StoreError::AccountNotFound(id))?
        };
        if let Some(expected) = expected_version {
            if expected != current {
                return Err(StoreError::WriteConflict(format!(
                    "account {id} at version {current}, expected {expected}"
                )));
            }
        }
        let base_version = self
            .staged_levels
            .get(&id)
            .map_or(expected_version.unwrap_or(current), |staged| staged.base_version);
        self.staged_levels.insert(
            id,
            StagedLevel {
                level: new_level,
                base_version,
            },
        );
        Ok(())
    }

    fn apply_commit(&mut self) -> Result<(), StoreError> {
        let mut inner = lock(&self.store.inner);

        for (id, staged) in &self.staged_levels {
            let account = inner.accounts.get(id).ok_or(StoreError::AccountNotFound(*id))?;
            if account.version != staged.base_version {
                return Err(StoreError::WriteConflict(format!(
                    "account {id} moved to version {} before commit",
                    account.version
                )));
            }
        }
        if let Some(record) = &self.staged_record {
            if inner.by_key.contains_key(&record.idempotency_key) {
                return Err(StoreError::WriteConflict(format!(
                    "idempotency key {} committed concurrently",
                    record.idempotency_key
                )));
            }
        }

        for (id, staged) in self.staged_levels.drain() {
            if let Some(account) = inner.accounts.get_mut(&id) {
                account.level = staged.level;
                account.version += 1;
            }
        }
        if let Some(record) = self.staged_record.take() {
            let idx = inner.records.len();
            inner.by_key.insert(record.idempotency_key.clone(), idx);
            inner.records.push(record);
        }
        Ok(())
    }
}

impl StoreTx for InMemoryTx {
    fn insert_if_absent<'a>(
        &'a mut self,
        record: &'a MutationRecord,
    ) -> StoreFuture<'a, InsertOutcome> {
        Box::pin(async move {
            let committed = lock(&self.store.inner).record(&record.idempotency_key).cloned();
            if let Some(existing) = committed {
                return Ok(InsertOutcome::Existing(existing));
            }

            let handle = lock_handle(&self.store.key_locks, &record.idempotency_key);
            let guard = acquire(handle, self.store.lock_timeout, || {
                format!("insert lock for key {}", record.idempotency_key)
            })
            .await?;

            {
                let inner = lock(&self.store.inner);
                if let Some(existing) = inner.record(&record.idempotency_key) {
                    return Ok(InsertOutcome::Existing(existing.clone()));
                }
                if !inner.accounts.contains_key(&record.account_id) {
                    return Err(StoreError::AccountNotFound(record.account_id));
                }
            }

            self.key_guards.push(guard);
            self.staged_record = Some(record.clone());
            Ok(InsertOutcome::Inserted)
        })
    }

    fn lock_and_read_account(&mut self, id: AccountId) -> StoreFuture<'_, AccountSnapshot> {
        Box::pin(async move {
            // Fail fast on unknown accounts instead of waiting on a lock nobody holds.
            self.snapshot(id)?;
            if !self.account_guards.contains_key(&id) {
                let handle = lock_handle(&self.store.account_locks, &id);
                let guard = acquire(handle, self.store.lock_timeout, || {
                    format!("row lock for account {id}")
                })
                .await?;
                self.account_guards.insert(id, guard);
            }
            self.snapshot(id)
        })
    }

    fn read_account(&mut self, id: AccountId) -> StoreFuture<'_, AccountSnapshot> {
        Box::pin(async move { self.snapshot(id) })
    }

    fn write_account_level(&mut self, id: AccountId, new_level: i64) -> StoreFuture<'_, ()> {
        Box::pin(async move { self.stage_level(id, None, new_level) })
    }

    fn write_account_level_if_unchanged(
        &mut self,
        id: AccountId,
        expected_version: i64,
        new_level: i64,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move { self.stage_level(id, Some(expected_version), new_level) })
    }

    fn set_record_status<'a>(
        &'a mut self,
        key: &'a IdempotencyKey,
        status: MutationStatus,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            match &mut self.staged_record {
                Some(record) if &record.idempotency_key == key => {
                    if !record.status.can_transition_to(status) {
                        return Err(StoreError::Corrupt(format!(
                            "record {key} cannot move from {} to {}",
                            record.status.as_str(),
                            status.as_str()
                        )));
                    }
                    record.status = status;
                    Ok(())
                },
                _ => Err(StoreError::Corrupt(format!(
                    "no record {key} inserted in this transaction"
                ))),
            }
        })
    }

    fn commit(mut self: Box<Self>) -> StoreFuture<'static, ()> {
        let result = self.apply_commit();
        // Locks release when `self` drops, after the writes are visible.
        drop(self);
        Box::pin(async move { result })
    }

    fn rollback(self: Box<Self>) -> StoreFuture<'static, ()> {
        drop(self);
        Box::pin(async { Ok(()) })
    }
}
