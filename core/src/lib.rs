//! # Quota Ledger Core
//!
//! Core types and contracts for the quota ledger: accounts holding a
//! non-negative resource level (wallet balance in cents, ticket quota in units)
//! and the append-only ledger of mutations applied to them.
//!
//! ## Core Concepts
//!
//! - **Account**: Holder of a resource level that never drops below zero
//! - **`MutationRecord`**: One accepted mutation, keyed by a caller-supplied idempotency key
//! - **Classifier**: Maps a request intent (`CHARGE`, `PURCHASE`, `DEPOSIT`) to a kind and invariant
//! - **Store contracts**: The transactional capabilities the engine needs from storage
//! - **Environment**: Injected dependencies (clock) via traits
//!
//! This crate performs no I/O. The engine lives in `quota-ledger-runtime`,
//! storage adapters in `quota-ledger-postgres` and `quota-ledger-testing`.
//!
//! ## Example
//!
//! ```
//! use quota_ledger_core::classifier::classify;
//! use quota_ledger_core::types::MutationKind;
//!
//! let charge = classify("CHARGE").expect("known intent");
//! assert_eq!(charge.kind, MutationKind::Decrease);
//! assert!(classify("REFUND").is_err());
//! ```

#![forbid(unsafe_code)]

pub mod classifier;
pub mod error;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use error::{LedgerError, StoreError};

/// Environment module - Dependency injection traits
///
/// All time-dependent behavior goes through these traits so tests can pin
/// timestamps.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use quota_ledger_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let earlier = clock.now();
    /// assert!(clock.now() >= earlier);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
