//! Domain types for accounts and the mutation ledger.
//!
//! Value objects validate on construction, so anything that reaches the
//! engine as a [`Mutation`] already has a positive amount and a usable
//! idempotency key.

use crate::error::{LedgerError, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for an account
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(Uuid);

impl AccountId {
    /// Creates a new random `AccountId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an `AccountId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for AccountId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the user that owns an account
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(Uuid);

impl OwnerId {
    /// Creates a new random `OwnerId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an `OwnerId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for OwnerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a mutation record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(Uuid);

impl RecordId {
    /// Creates a new random `RecordId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `RecordId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller-supplied token that makes a logical mutation apply at most once.
///
/// Surrounding whitespace is trimmed. Keys must be non-empty and at most
/// [`IdempotencyKey::MAX_LEN`] bytes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Maximum key length in bytes (matches the storage column width)
    pub const MAX_LEN: usize = 255;

    /// Validate and wrap a raw key.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidIdempotencyKey`] if the key is empty or too long.
    pub fn parse(raw: &str) -> Result<Self, LedgerError> {
        let key = raw.trim();
        if key.is_empty() {
            return Err(LedgerError::InvalidIdempotencyKey(
                "idempotency key must not be empty".to_string(),
            ));
        }
        if key.len() > Self::MAX_LEN {
            return Err(LedgerError::InvalidIdempotencyKey(format!(
                "idempotency key must be at most {} bytes, got {}",
                Self::MAX_LEN,
                key.len()
            )));
        }
        Ok(Self(key.to_string()))
    }

    /// Get the key as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for IdempotencyKey {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<IdempotencyKey> for String {
    fn from(key: IdempotencyKey) -> Self {
        key.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for IdempotencyKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Value Objects
// ============================================================================

/// Strictly positive mutation magnitude (cents or units).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Amount(i64);

impl Amount {
    /// Create an `Amount`, rejecting zero and negative values.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidAmount`] if `value <= 0`.
    pub const fn new(value: i64) -> Result<Self, LedgerError> {
        if value <= 0 {
            return Err(LedgerError::InvalidAmount(value));
        }
        Ok(Self(value))
    }

    /// Get the raw value
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl TryFrom<i64> for Amount {
    type Error = LedgerError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for i64 {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Direction of a mutation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationKind {
    /// Adds to the level (deposit, quota release)
    Increase,
    /// Takes from the level (charge, ticket purchase)
    Decrease,
}

impl MutationKind {
    /// Convert kind to its storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Increase => "INCREASE",
            Self::Decrease => "DECREASE",
        }
    }

    /// Parse kind from its storage representation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corrupt`] for an unknown value.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "INCREASE" => Ok(Self::Increase),
            "DECREASE" => Ok(Self::Decrease),
            _ => Err(StoreError::Corrupt(format!("Invalid mutation kind: {s}"))),
        }
    }

    /// Signed delta for an amount of this kind.
    #[must_use]
    pub const fn signed(self, amount: Amount) -> i64 {
        match self {
            Self::Increase => amount.0,
            Self::Decrease => -amount.0,
        }
    }

    /// Level after applying `amount`, or `None` on overflow or a negative result.
    #[must_use]
    pub const fn apply(self, level: i64, amount: Amount) -> Option<i64> {
        let next = match self {
            Self::Increase => level.checked_add(amount.0),
            Self::Decrease => level.checked_sub(amount.0),
        };
        match next {
            Some(value) if value >= 0 => Some(value),
            _ => None,
        }
    }
}

/// Lifecycle of a mutation record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationStatus {
    /// Inserted, not yet settled
    Pending,
    /// Settled without applying the delta
    Failed,
    /// Delta applied to the account
    Succeeded,
}

impl MutationStatus {
    /// Convert status to its storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Failed => "FAILED",
            Self::Succeeded => "SUCCEEDED",
        }
    }

    /// Parse status from its storage representation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corrupt`] for an unknown value.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "FAILED" => Ok(Self::Failed),
            "SUCCEEDED" => Ok(Self::Succeeded),
            _ => Err(StoreError::Corrupt(format!("Invalid mutation status: {s}"))),
        }
    }

    /// Whether `self -> next` is an allowed transition.
    ///
    /// Only `Pending` may move, and only to a settled state.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Succeeded | Self::Failed)
        )
    }
}

// ============================================================================
// Entities
// ============================================================================

/// An account and its current resource level.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// Account identifier
    pub id: AccountId,
    /// Owning user
    pub owner_id: OwnerId,
    /// Current level, never negative
    pub level: i64,
    /// Bumped on every level write
    pub version: i64,
    /// When the account was opened
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Creates a new account at version 0.
    #[must_use]
    pub fn open(owner_id: OwnerId, level: i64, created_at: DateTime<Utc>) -> Self {
        Self {
            id: AccountId::new(),
            owner_id,
            level,
            version: 0,
            created_at,
        }
    }
}

/// Level and version of an account as read inside a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccountSnapshot {
    /// Account that was read
    pub account_id: AccountId,
    /// Level at read time
    pub level: i64,
    /// Version at read time
    pub version: i64,
}

/// One entry of the append-only mutation ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRecord {
    /// Record identifier
    pub id: RecordId,
    /// Account the delta applies to
    pub account_id: AccountId,
    /// Globally unique idempotency key
    pub idempotency_key: IdempotencyKey,
    /// Signed delta: negative for decreases
    pub delta: i64,
    /// Direction of the mutation
    pub kind: MutationKind,
    /// Current status
    pub status: MutationStatus,
    /// When the record was created
    pub created_at: DateTime<Utc>,
}

impl MutationRecord {
    /// Build the pending record for a mutation attempt.
    #[must_use]
    pub fn pending(id: RecordId, mutation: &Mutation, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            account_id: mutation.account_id,
            idempotency_key: mutation.idempotency_key.clone(),
            delta: mutation.signed_delta(),
            kind: mutation.kind,
            status: MutationStatus::Pending,
            created_at,
        }
    }

    /// Return the record with a new status.
    #[must_use]
    pub fn with_status(mut self, status: MutationStatus) -> Self {
        self.status = status;
        self
    }

    /// Magnitude of the delta
    #[must_use]
    pub const fn amount(&self) -> u64 {
        self.delta.unsigned_abs()
    }

    /// Whether a replayed mutation carries the same payload as this record.
    #[must_use]
    pub fn matches(&self, mutation: &Mutation) -> bool {
        self.account_id == mutation.account_id
            && self.kind == mutation.kind
            && self.delta == mutation.signed_delta()
    }
}

// ============================================================================
// Requests
// ============================================================================

/// A validated, classified mutation ready for the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mutation {
    /// Target account
    pub account_id: AccountId,
    /// Idempotency key
    pub idempotency_key: IdempotencyKey,
    /// Magnitude
    pub amount: Amount,
    /// Direction
    pub kind: MutationKind,
}

impl Mutation {
    /// Creates a new `Mutation`
    #[must_use]
    pub const fn new(
        account_id: AccountId,
        idempotency_key: IdempotencyKey,
        amount: Amount,
        kind: MutationKind,
    ) -> Self {
        Self {
            account_id,
            idempotency_key,
            amount,
            kind,
        }
    }

    /// Signed delta this mutation applies
    #[must_use]
    pub const fn signed_delta(&self) -> i64 {
        self.kind.signed(self.amount)
    }
}

/// Mutation request as received from a transport, before classification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRequest {
    /// Target account
    pub account_id: AccountId,
    /// Caller-supplied idempotency key
    pub idempotency_key: String,
    /// Requested magnitude
    pub amount: i64,
    /// Declared intent (`CHARGE`, `PURCHASE`, `DEPOSIT`)
    pub intent: String,
}
