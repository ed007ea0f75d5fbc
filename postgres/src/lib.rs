//! `PostgreSQL` storage for the quota ledger.
//!
//! This crate provides the production implementation of the store contracts
//! from `quota-ledger-core`:
//!
//! - Transactions with a bounded `lock_timeout`
//! - Row locks and version compare-and-set for the two locking strategies
//! - Idempotent record insertion on a unique key
//! - Embedded migrations
//!
//! # Example
//!
//! ```ignore
//! use quota_ledger_postgres::{PostgresConfig, PostgresStore};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresStore::connect(&PostgresConfig::new("postgres://localhost/ledger")).await?;
//!     store.migrate().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod store;

pub use config::PostgresConfig;
pub use store::PostgresStore;
