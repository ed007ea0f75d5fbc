//! Axum HTTP transport for the quota ledger.
//!
//! A thin shell over [`LedgerEngine`](quota_ledger_runtime::LedgerEngine):
//! handlers parse JSON, call the engine or the account repository, and map
//! [`LedgerError`](quota_ledger_core::LedgerError) onto status codes through
//! [`AppError`].
//!
//! # Request Flow
//!
//! 1. **Correlation ID** is extracted or generated, and a span opened
//! 2. **Extract** the JSON body or path parameters
//! 3. **Submit** to the engine, which classifies and retries internally
//! 4. **Map** the record or error to a response
//!
//! # Example
//!
//! ```ignore
//! use quota_ledger_web::{AppState, router};
//!
//! let state = AppState::new(engine, accounts, Arc::new(SystemClock));
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//! axum::serve(listener, router(state)).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod router;
pub mod state;

// Re-export key types for convenience
pub use error::{AppError, ErrorResponse};
pub use middleware::{CORRELATION_ID_HEADER, CorrelationId, correlation_id_layer};
pub use router::router;
pub use state::AppState;

/// Result type alias for web handlers.
pub type WebResult<T> = Result<T, AppError>;
