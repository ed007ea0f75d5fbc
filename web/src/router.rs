//! Route table.

use crate::handlers;
use crate::middleware::correlation_id_layer;
use crate::state::AppState;
use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

/// Build the ledger API router.
///
/// | Method | Path | Handler |
/// |--------|------|---------|
/// | `POST` | `/transactions` | apply a mutation |
/// | `GET` | `/transactions/:key` | record by idempotency key |
/// | `POST` | `/accounts` | open an account |
/// | `GET` | `/accounts/:id` | account |
/// | `GET` | `/accounts/:id/transactions` | history, newest first |
/// | `GET` | `/health` | liveness |
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/transactions", post(handlers::submit_transaction))
        .route("/transactions/:key", get(handlers::get_transaction))
        .route("/accounts", post(handlers::open_account))
        .route("/accounts/:id", get(handlers::get_account))
        .route("/accounts/:id/transactions", get(handlers::list_transactions))
        .route("/health", get(handlers::health_check))
        .layer(TraceLayer::new_for_http())
        .layer(correlation_id_layer())
        .with_state(state)
}
