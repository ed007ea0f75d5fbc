//! Application state for Axum handlers.

use quota_ledger_core::environment::Clock;
use quota_ledger_core::store::AccountRepository;
use quota_ledger_runtime::LedgerEngine;
use std::sync::Arc;

/// Shared state for every HTTP handler.
///
/// The engine owns all writes to account levels. The repository serves
/// provisioning and read endpoints.
#[derive(Clone)]
pub struct AppState {
    /// Applies mutations
    pub engine: Arc<LedgerEngine>,
    /// Opens accounts and reads ledger history
    pub accounts: Arc<dyn AccountRepository>,
    /// Stamps newly opened accounts
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Create a new application state.
    #[must_use]
    pub fn new(
        engine: LedgerEngine,
        accounts: Arc<dyn AccountRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            engine: Arc::new(engine),
            accounts,
            clock,
        }
    }
}
