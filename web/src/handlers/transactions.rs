//! Mutation endpoint and single-record lookup.

use crate::error::AppError;
use crate::state::AppState;
use axum::{
    Json,
    extract::{
        Path, State,
        rejection::{JsonRejection, PathRejection},
    },
};
use quota_ledger_core::error::LedgerError;
use quota_ledger_core::types::{IdempotencyKey, MutationRecord, MutationRequest};

/// Apply a mutation with the engine's retry policy.
///
/// # Endpoint
///
/// ```text
/// POST /transactions
/// ```
///
/// # Request
///
/// ```json
/// {
///   "accountId": "…",
///   "idempotencyKey": "order-1234",
///   "amount": 30,
///   "intent": "CHARGE"
/// }
/// ```
///
/// Resubmitting the same `idempotencyKey` returns the original record.
///
/// # Errors
///
/// - 400: Unparseable body, bad intent, amount or key, or insufficient level
/// - 404: Unknown account
/// - 503: Contention persisted through every retry
pub async fn submit_transaction(
    State(state): State<AppState>,
    payload: Result<Json<MutationRequest>, JsonRejection>,
) -> Result<Json<MutationRecord>, AppError> {
    let Json(request) = payload?;
    let record = state.engine.submit(&request).await?;
    Ok(Json(record))
}

/// Look up a record by idempotency key.
///
/// # Endpoint
///
/// ```text
/// GET /transactions/:idempotency_key
/// ```
///
/// # Errors
///
/// - 400: Malformed key
/// - 404: No record stored under the key
pub async fn get_transaction(
    State(state): State<AppState>,
    key: Result<Path<String>, PathRejection>,
) -> Result<Json<MutationRecord>, AppError> {
    let Path(key) = key?;
    let key = IdempotencyKey::parse(&key)?;
    state
        .accounts
        .find_record(&key)
        .await
        .map_err(LedgerError::from)?
        .map(Json)
        .ok_or_else(|| AppError::not_found("Transaction", &key))
}
