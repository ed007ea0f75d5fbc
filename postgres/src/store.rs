//! `PostgreSQL` implementation of the ledger store contracts.
//!
//! Concurrency control is delegated to the database:
//!
//! - `SELECT ... FOR NO KEY UPDATE` for the pessimistic row lock. The
//!   record insert already holds `FOR KEY SHARE` on the account through the
//!   foreign key, and `FOR UPDATE` would conflict with another attempt's
//!   share lock and deadlock; `FOR NO KEY UPDATE` still excludes other writers
//! - `UPDATE ... WHERE version = $n` for the optimistic compare-and-set
//! - `INSERT ... ON CONFLICT (idempotency_key) DO NOTHING` for idempotency;
//!   a concurrent insert of the same key blocks on the unique index until the
//!   first transaction ends
//! - `CHECK (level >= 0)` as the last line of defense for non-negativity
//!
//! Every transaction starts with `SET LOCAL lock_timeout` so lock waits are
//! bounded and surface as [`StoreError::LockTimeout`].

use crate::config::{PostgresConfig, bounded_lock_timeout};
use chrono::{DateTime, Utc};
use metrics::counter;
use quota_ledger_core::error::StoreError;
use quota_ledger_core::store::{AccountRepository, InsertOutcome, ResourceStore, StoreFuture, StoreTx};
use quota_ledger_core::types::{
    Account, AccountId, AccountSnapshot, IdempotencyKey, MutationKind, MutationRecord,
    MutationStatus, OwnerId, RecordId,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::time::Duration;
use uuid::Uuid;

const RECORD_COLUMNS: &str = "id, account_id, idempotency_key, delta, kind, status, created_at";

/// Map a sqlx error onto the store taxonomy by SQLSTATE.
fn map_sqlx(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        let mapped = match db_err.code().as_deref() {
            Some("40001" | "40P01") => Some(StoreError::WriteConflict(db_err.message().to_string())),
            Some("55P03") => Some(StoreError::LockTimeout(db_err.message().to_string())),
            Some("23514") => Some(StoreError::ConstraintViolation(db_err.message().to_string())),
            _ => None,
        };
        if let Some(mapped) = mapped {
            counter!("ledger_store_contention_total", "sqlstate" => db_err.code().unwrap_or_default().into_owned())
                .increment(1);
            return mapped;
        }
    }
    StoreError::Database(err.to_string())
}

fn is_sqlstate(err: &sqlx::Error, code: &str) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some(code))
}

fn row_to_snapshot(row: &PgRow) -> Result<AccountSnapshot, StoreError> {
    let id: Uuid = row.try_get("id").map_err(map_sqlx)?;
    Ok(AccountSnapshot {
        account_id: AccountId::from_uuid(id),
        level: row.try_get("level").map_err(map_sqlx)?,
        version: row.try_get("version").map_err(map_sqlx)?,
    })
}

fn row_to_account(row: &PgRow) -> Result<Account, StoreError> {
    let id: Uuid = row.try_get("id").map_err(map_sqlx)?;
    let owner_id: Uuid = row.try_get("owner_id").map_err(map_sqlx)?;
    Ok(Account {
        id: AccountId::from_uuid(id),
        owner_id: OwnerId::from_uuid(owner_id),
        level: row.try_get("level").map_err(map_sqlx)?,
        version: row.try_get("version").map_err(map_sqlx)?,
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
    })
}

fn row_to_record(row: &PgRow) -> Result<MutationRecord, StoreError> {
    let id: Uuid = row.try_get("id").map_err(map_sqlx)?;
    let account_id: Uuid = row.try_get("account_id").map_err(map_sqlx)?;
    let key: String = row.try_get("idempotency_key").map_err(map_sqlx)?;
    let kind: String = row.try_get("kind").map_err(map_sqlx)?;
    let status: String = row.try_get("status").map_err(map_sqlx)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(map_sqlx)?;

    Ok(MutationRecord {
        id: RecordId::from_uuid(id),
        account_id: AccountId::from_uuid(account_id),
        idempotency_key: IdempotencyKey::parse(&key)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        delta: row.try_get("delta").map_err(map_sqlx)?,
        kind: MutationKind::parse(&kind)?,
        status: MutationStatus::parse(&status)?,
        created_at,
    })
}

/// `PostgreSQL`-backed ledger store.
///
/// # Example
///
/// ```no_run
/// use quota_ledger_postgres::{PostgresConfig, PostgresStore};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = PostgresStore::connect(&PostgresConfig::new("postgres://localhost/ledger")).await?;
/// store.migrate().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct PostgresStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PostgresStore {
    /// Open a connection pool.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the database is unreachable.
    pub async fn connect(config: &PostgresConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .connect(&config.url)
            .await
            .map_err(map_sqlx)?;

        tracing::info!(
            max_connections = config.max_connections,
            lock_timeout_ms = u64::try_from(config.lock_timeout.as_millis()).unwrap_or(u64::MAX),
            "Connected to PostgreSQL"
        );
        Ok(Self::from_pool(pool, config.lock_timeout))
    }

    /// Wrap an existing pool.
    ///
    /// `lock_timeout` is clamped to at least one millisecond.
    #[must_use]
    pub const fn from_pool(pool: PgPool, lock_timeout: Duration) -> Self {
        Self {
            pool,
            lock_timeout: bounded_lock_timeout(lock_timeout),
        }
    }

    /// Underlying pool
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    ///
    /// # Errors
    ///
    /// Returns error if migrations fail.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))?;
        Ok(())
    }
}

impl ResourceStore for PostgresStore {
    fn begin(&self) -> StoreFuture<'_, Box<dyn StoreTx>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
            // SET does not accept bind parameters. Zero would disable the timeout.
            let statement = format!("SET LOCAL lock_timeout = '{}ms'", self.lock_timeout.as_millis());
            sqlx::query(&statement)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
            Ok(Box::new(PostgresTx { tx }) as Box<dyn StoreTx>)
        })
    }
}

impl AccountRepository for PostgresStore {
    fn open_account(&self, account: Account) -> StoreFuture<'_, Account> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO accounts (id, owner_id, level, version, created_at)
                VALUES ($1, $2, $3, $4, $5)
                ",
            )
            .bind(account.id.as_uuid())
            .bind(account.owner_id.as_uuid())
            .bind(account.level)
            .bind(account.version)
            .bind(account.created_at)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_sqlstate(&e, "23505") {
                    StoreError::AccountAlreadyExists(account.owner_id)
                } else {
                    map_sqlx(e)
                }
            })?;

            tracing::info!(account_id = %account.id, owner_id = %account.owner_id, "Account opened");
            Ok(account)
        })
    }

    fn get_account(&self, id: AccountId) -> StoreFuture<'_, Option<Account>> {
        Box::pin(async move {
            let row = sqlx::query(
                "SELECT id, owner_id, level, version, created_at FROM accounts WHERE id = $1",
            )
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;

            row.as_ref().map(row_to_account).transpose()
        })
    }

    fn list_records(&self, id: AccountId, limit: usize) -> StoreFuture<'_, Vec<MutationRecord>> {
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                "SELECT {RECORD_COLUMNS} FROM mutation_records WHERE account_id = $1 ORDER BY seq DESC LIMIT $2"
            ))
            .bind(id.as_uuid())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;

            rows.iter().map(row_to_record).collect()
        })
    }

    fn find_record<'a>(
        &'a self,
        key: &'a IdempotencyKey,
    ) -> StoreFuture<'a, Option<MutationRecord>> {
        Box::pin(async move {
            let row = sqlx::query(&format!(
                "SELECT {RECORD_COLUMNS} FROM mutation_records WHERE idempotency_key = $1"
            ))
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;

            row.as_ref().map(row_to_record).transpose()
        })
    }
}

/// One open `PostgreSQL` transaction. Dropping it rolls back.
struct PostgresTx {
    tx: Transaction<'static, Postgres>,
}

impl StoreTx for PostgresTx {
    fn insert_if_absent<'a>(
        &'a mut self,
        record: &'a MutationRecord,
    ) -> StoreFuture<'a, InsertOutcome> {
        Box::pin(async move {
            let inserted = sqlx::query(
                r"
                INSERT INTO mutation_records
                    (id, account_id, idempotency_key, delta, kind, status, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (idempotency_key) DO NOTHING
                ",
            )
            .bind(record.id.as_uuid())
            .bind(record.account_id.as_uuid())
            .bind(record.idempotency_key.as_str())
            .bind(record.delta)
            .bind(record.kind.as_str())
            .bind(record.status.as_str())
            .bind(record.created_at)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| {
                if is_sqlstate(&e, "23503") {
                    StoreError::AccountNotFound(record.account_id)
                } else {
                    map_sqlx(e)
                }
            })?;

            if inserted.rows_affected() == 1 {
                return Ok(InsertOutcome::Inserted);
            }

            let row = sqlx::query(&format!(
                "SELECT {RECORD_COLUMNS} FROM mutation_records WHERE idempotency_key = $1"
            ))
            .bind(record.idempotency_key.as_str())
            .fetch_one(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;

            Ok(InsertOutcome::Existing(row_to_record(&row)?))
        })
    }

    fn lock_and_read_account(&mut self, id: AccountId) -> StoreFuture<'_, AccountSnapshot> {
        Box::pin(async move {
            let row = sqlx::query("SELECT id, level, version FROM accounts WHERE id = $1 FOR NO KEY UPDATE")
                .bind(id.as_uuid())
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(map_sqlx)?
                .ok_or(StoreError::AccountNotFound(id))?;

            row_to_snapshot(&row)
        })
    }

    fn read_account(&mut self, id: AccountId) -> StoreFuture<'_, AccountSnapshot> {
        Box::pin(async move {
            let row = sqlx::query("SELECT id, level, version FROM accounts WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(map_sqlx)?
                .ok_or(StoreError::AccountNotFound(id))?;

            row_to_snapshot(&row)
        })
    }

    fn write_account_level(&mut self, id: AccountId, new_level: i64) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let result = sqlx::query(
                "UPDATE accounts SET level = $2, version = version + 1 WHERE id = $1",
            )
            .bind(id.as_uuid())
            .bind(new_level)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;

            if result.rows_affected() == 0 {
                return Err(StoreError::AccountNotFound(id));
            }
            Ok(())
        })
    }

    fn write_account_level_if_unchanged(
        &mut self,
        id: AccountId,
        expected_version: i64,
        new_level: i64,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE accounts SET level = $2, version = version + 1
                WHERE id = $1 AND version = $3
                ",
            )
            .bind(id.as_uuid())
            .bind(new_level)
            .bind(expected_version)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;

            if result.rows_affected() == 0 {
                counter!("ledger_store_contention_total", "sqlstate" => "version").increment(1);
                return Err(StoreError::WriteConflict(format!(
                    "account {id} no longer at version {expected_version}"
                )));
            }
            Ok(())
        })
    }

    fn set_record_status<'a>(
        &'a mut self,
        key: &'a IdempotencyKey,
        status: MutationStatus,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let result = sqlx::query(
                "UPDATE mutation_records SET status = $2 WHERE idempotency_key = $1 AND status = 'PENDING'",
            )
            .bind(key.as_str())
            .bind(status.as_str())
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;

            if result.rows_affected() == 0 {
                return Err(StoreError::Corrupt(format!("no pending record {key}")));
            }
            Ok(())
        })
    }

    fn commit(self: Box<Self>) -> StoreFuture<'static, ()> {
        let Self { tx } = *self;
        Box::pin(async move { tx.commit().await.map_err(map_sqlx) })
    }

    fn rollback(self: Box<Self>) -> StoreFuture<'static, ()> {
        let Self { tx } = *self;
        Box::pin(async move { tx.rollback().await.map_err(map_sqlx) })
    }
}
