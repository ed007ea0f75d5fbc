//! # Quota Ledger Testing
//!
//! Testing utilities for the quota ledger.
//!
//! This crate provides:
//! - [`InMemoryStore`]: Both store contracts in memory, with real row locks and rollback
//! - [`ConflictInjectingStore`]: Fails a configurable number of level writes
//! - Mock implementations of Environment traits
//!
//! ## Example
//!
//! ```ignore
//! use quota_ledger_testing::{InMemoryStore, test_clock};
//! use quota_ledger_runtime::{EngineConfig, LedgerEngine};
//!
//! #[tokio::test]
//! async fn test_charge() {
//!     let store = Arc::new(InMemoryStore::new());
//!     let account = store.seed_account(100);
//!     let engine = LedgerEngine::new(store.clone(), Arc::new(test_clock()), EngineConfig::default());
//!
//!     engine.apply(account, "k1", 30, MutationKind::Decrease).await?;
//!     assert_eq!(store.level_of(account), Some(70));
//! }
//! ```

use chrono::{DateTime, Utc};
use quota_ledger_core::environment::Clock;

mod conflict;
mod memory;

pub use conflict::ConflictInjectingStore;
pub use memory::InMemoryStore;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use quota_ledger_testing::mocks::FixedClock;
    /// use quota_ledger_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

// Re-export commonly used items
pub use mocks::{FixedClock, test_clock};
