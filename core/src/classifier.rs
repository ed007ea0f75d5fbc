//! Request classification.
//!
//! Maps a declared intent onto the mutation kind and the invariant the engine
//! enforces for it:
//!
//! | Intent | Kind | Invariant |
//! |---|---|---|
//! | `CHARGE`, `PURCHASE` | decrease | resulting level stays non-negative |
//! | `DEPOSIT` | increase | amount must be positive |
//!
//! Matching ignores ASCII case and surrounding whitespace.

use crate::error::LedgerError;
use crate::types::{Amount, AccountSnapshot, IdempotencyKey, Mutation, MutationKind, MutationRequest};
use std::fmt;
use std::str::FromStr;

/// Declared purpose of a mutation request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Intent {
    /// Debit a wallet balance
    Charge,
    /// Take units from a ticket quota
    Purchase,
    /// Credit a wallet balance
    Deposit,
}

impl Intent {
    /// Canonical name
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Charge => "CHARGE",
            Self::Purchase => "PURCHASE",
            Self::Deposit => "DEPOSIT",
        }
    }

    /// Direction of the mutation this intent performs
    #[must_use]
    pub const fn kind(&self) -> MutationKind {
        match self {
            Self::Charge | Self::Purchase => MutationKind::Decrease,
            Self::Deposit => MutationKind::Increase,
        }
    }
}

impl FromStr for Intent {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        [Self::Charge, Self::Purchase, Self::Deposit]
            .into_iter()
            .find(|intent| intent.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| LedgerError::InvalidIntent(trimmed.to_string()))
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rule a mutation must satisfy against the account it targets
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Invariant {
    /// The level after applying the mutation must be `>= 0`
    NonNegativeResult,
    /// Only the amount itself is constrained (enforced by [`Amount`])
    PositiveAmountOnly,
}

impl Invariant {
    /// Check the invariant against a level read inside the transaction.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InsufficientResource`] when a decrease exceeds the level.
    pub const fn check(&self, snapshot: &AccountSnapshot, amount: Amount) -> Result<(), LedgerError> {
        match self {
            Self::NonNegativeResult if snapshot.level < amount.get() => {
                Err(LedgerError::InsufficientResource {
                    account_id: snapshot.account_id,
                    level: snapshot.level,
                    requested: amount.get(),
                })
            },
            Self::NonNegativeResult | Self::PositiveAmountOnly => Ok(()),
        }
    }
}

impl MutationKind {
    /// Invariant enforced for mutations of this kind
    #[must_use]
    pub const fn invariant(&self) -> Invariant {
        match self {
            Self::Decrease => Invariant::NonNegativeResult,
            Self::Increase => Invariant::PositiveAmountOnly,
        }
    }
}

/// Outcome of classifying an intent
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Classification {
    /// Parsed intent
    pub intent: Intent,
    /// Mutation direction
    pub kind: MutationKind,
    /// Rule the engine enforces
    pub invariant: Invariant,
}

/// Classify an intent string.
///
/// # Errors
///
/// Returns [`LedgerError::InvalidIntent`] for unknown intents.
pub fn classify(intent: &str) -> Result<Classification, LedgerError> {
    let intent: Intent = intent.parse()?;
    let kind = intent.kind();
    Ok(Classification {
        intent,
        kind,
        invariant: kind.invariant(),
    })
}

/// Classify and validate a raw request into a [`Mutation`].
///
/// Intent is checked first, then amount, then idempotency key.
///
/// # Errors
///
/// Returns `InvalidIntent`, `InvalidAmount` or `InvalidIdempotencyKey`.
pub fn classify_request(request: &MutationRequest) -> Result<Mutation, LedgerError> {
    let classification = classify(&request.intent)?;
    let amount = Amount::new(request.amount)?;
    let key = IdempotencyKey::parse(&request.idempotency_key)?;
    Ok(Mutation::new(request.account_id, key, amount, classification.kind))
}
