//! Error taxonomy for ledger operations.
//!
//! Two layers:
//!
//! - [`StoreError`]: what a storage adapter reports (conflicts, timeouts,
//!   missing rows, transport failures)
//! - [`LedgerError`]: what callers of the engine see, including caller
//!   validation failures and the business rule on non-negative levels
//!
//! Transient contention (`WriteConflict`, `LockTimeout`) is the only class the
//! retry coordinator retries. Everything else terminates an attempt loop.

use crate::types::{AccountId, OwnerId};
use thiserror::Error;

/// Errors reported by a storage adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Concurrent transactions collided on the same row.
    ///
    /// Raised for serialization failures, deadlocks, and compare-and-set
    /// writes whose expected version no longer matches.
    #[error("Write conflict: {0}")]
    WriteConflict(String),

    /// Waiting for a row lock exceeded the configured bound.
    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    /// The referenced account does not exist.
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    /// An account is already registered for this owner.
    #[error("Account already exists for owner {0}")]
    AccountAlreadyExists(OwnerId),

    /// A declarative constraint rejected the write (e.g. `level >= 0`).
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Connection, query, or commit failure.
    #[error("Database error: {0}")]
    Database(String),

    /// A stored row could not be decoded.
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether this error signals transient contention worth retrying.
    #[must_use]
    pub const fn is_contention(&self) -> bool {
        matches!(self, Self::WriteConflict(_) | Self::LockTimeout(_))
    }
}

/// Errors returned by ledger operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// The amount is not a positive integer, or applying it would overflow the level.
    #[error("Amount must be a positive integer within range, got {0}")]
    InvalidAmount(i64),

    /// The request intent is not one of the known mutation intents.
    #[error("Invalid intent {0:?}, must be CHARGE, PURCHASE or DEPOSIT")]
    InvalidIntent(String),

    /// The idempotency key is empty or too long.
    #[error("Invalid idempotency key: {0}")]
    InvalidIdempotencyKey(String),

    /// A decrease would drive the level below zero.
    #[error("Insufficient resource on account {account_id}: level {level}, requested {requested}")]
    InsufficientResource {
        /// Account that was charged
        account_id: AccountId,
        /// Level observed inside the transaction
        level: i64,
        /// Amount the caller tried to take
        requested: i64,
    },

    /// The referenced account does not exist.
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    /// An account is already registered for this owner.
    #[error("Account already exists for owner {0}")]
    AccountAlreadyExists(OwnerId),

    /// A concurrent writer won the race for the account row.
    #[error("Write conflict: {0}")]
    WriteConflict(String),

    /// The account row lock could not be acquired in time.
    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    /// Every attempt ended in contention.
    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Number of attempts made
        attempts: u32,
        /// Error from the final attempt
        last: Box<LedgerError>,
    },

    /// Storage transport failure.
    #[error("Store error: {0}")]
    Store(StoreError),
}

impl LedgerError {
    /// Whether the retry coordinator should try the attempt again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::WriteConflict(_) | Self::LockTimeout(_))
    }

    /// Whether the error is the caller's fault (bad input or a business rule).
    ///
    /// Client errors are never retried: retrying cannot change the outcome.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidAmount(_)
                | Self::InvalidIntent(_)
                | Self::InvalidIdempotencyKey(_)
                | Self::InsufficientResource { .. }
                | Self::AccountNotFound(_)
                | Self::AccountAlreadyExists(_)
        )
    }

    /// Stable machine-readable code for transport layers.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidAmount(_) => "INVALID_AMOUNT",
            Self::InvalidIntent(_) => "INVALID_INTENT",
            Self::InvalidIdempotencyKey(_) => "INVALID_IDEMPOTENCY_KEY",
            Self::InsufficientResource { .. } => "INSUFFICIENT_RESOURCE",
            Self::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            Self::AccountAlreadyExists(_) => "ACCOUNT_ALREADY_EXISTS",
            Self::WriteConflict(_) => "WRITE_CONFLICT",
            Self::LockTimeout(_) => "LOCK_TIMEOUT",
            Self::RetriesExhausted { .. } => "RETRIES_EXHAUSTED",
            Self::Store(_) => "STORE_ERROR",
        }
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::WriteConflict(detail) => Self::WriteConflict(detail),
            StoreError::LockTimeout(detail) => Self::LockTimeout(detail),
            StoreError::AccountNotFound(id) => Self::AccountNotFound(id),
            StoreError::AccountAlreadyExists(owner) => Self::AccountAlreadyExists(owner),
            other => Self::Store(other),
        }
    }
}
