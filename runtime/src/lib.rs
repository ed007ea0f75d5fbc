//! # Quota Ledger Runtime
//!
//! Executes mutations against accounts while keeping three guarantees under
//! concurrent load:
//!
//! - A mutation with a given idempotency key applies at most once
//! - An account level never drops below zero
//! - Conflicting writers either serialize or fail cleanly and retry
//!
//! ## Core Components
//!
//! - **Engine**: [`LedgerEngine`] runs one all-or-nothing attempt per call
//! - **Retry**: [`retry::retry_with_jitter`] retries contention with jittered backoff
//! - **Metrics**: Prometheus recorders for outcomes, replays and retries
//!
//! ## Example
//!
//! ```ignore
//! use quota_ledger_runtime::{EngineConfig, LedgerEngine};
//! use quota_ledger_core::types::MutationKind;
//!
//! let engine = LedgerEngine::new(store, clock, EngineConfig::default());
//! let record = engine.apply(account_id, "order-42", 30, MutationKind::Decrease).await?;
//! ```

/// Ledger engine
pub mod engine;

/// Retry with jittered backoff
pub mod retry;

/// Prometheus metrics for observability
pub mod metrics;

pub use engine::{EngineConfig, LedgerEngine, LockingStrategy};
pub use retry::{RetryError, RetryPolicy};
