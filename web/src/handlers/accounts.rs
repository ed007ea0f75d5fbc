//! Account provisioning and ledger history.

use crate::error::AppError;
use crate::state::AppState;
use axum::{
    Json,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, PathRejection, QueryRejection},
    },
    http::StatusCode,
};
use quota_ledger_core::error::LedgerError;
use quota_ledger_core::types::{Account, AccountId, MutationRecord, OwnerId};
use serde::Deserialize;

/// Records returned when no `limit` is given
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Upper bound on `limit`
pub const MAX_HISTORY_LIMIT: usize = 500;

/// Body of `POST /accounts`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenAccountRequest {
    /// Owner the account belongs to
    pub owner_id: OwnerId,
    /// Starting level, zero when omitted
    #[serde(default)]
    pub initial_level: i64,
}

/// Query string of `GET /accounts/:id/transactions`.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct HistoryQuery {
    /// Maximum number of records
    pub limit: Option<usize>,
}

impl HistoryQuery {
    fn effective_limit(self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .min(MAX_HISTORY_LIMIT)
    }
}

/// Open an account for an owner.
///
/// # Endpoint
///
/// ```text
/// POST /accounts
/// ```
///
/// # Errors
///
/// - 400: Unparseable body or negative `initialLevel`
/// - 409: The owner already has an account
pub async fn open_account(
    State(state): State<AppState>,
    payload: Result<Json<OpenAccountRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Account>), AppError> {
    let Json(request) = payload?;
    if request.initial_level < 0 {
        return Err(AppError::bad_request(format!(
            "initialLevel must not be negative, got {}",
            request.initial_level
        )));
    }

    let account = Account::open(request.owner_id, request.initial_level, state.clock.now());
    let account = state
        .accounts
        .open_account(account)
        .await
        .map_err(LedgerError::from)?;

    tracing::info!(
        account_id = %account.id,
        owner_id = %account.owner_id,
        level = account.level,
        "Account opened"
    );

    Ok((StatusCode::CREATED, Json(account)))
}

/// Fetch an account.
///
/// # Endpoint
///
/// ```text
/// GET /accounts/:id
/// ```
///
/// # Errors
///
/// - 400: Malformed account id
/// - 404: Unknown account
pub async fn get_account(
    State(state): State<AppState>,
    id: Result<Path<AccountId>, PathRejection>,
) -> Result<Json<Account>, AppError> {
    let Path(id) = id?;
    state
        .accounts
        .get_account(id)
        .await
        .map_err(LedgerError::from)?
        .map(Json)
        .ok_or_else(|| AppError::not_found("Account", id))
}

/// List an account's records, newest first.
///
/// # Endpoint
///
/// ```text
/// GET /accounts/:id/transactions?limit=20
/// ```
///
/// # Errors
///
/// - 400: Malformed account id or `limit`
/// - 404: Unknown account
pub async fn list_transactions(
    State(state): State<AppState>,
    id: Result<Path<AccountId>, PathRejection>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<Json<Vec<MutationRecord>>, AppError> {
    let Path(id) = id?;
    let Query(query) = query?;
    let exists = state
        .accounts
        .get_account(id)
        .await
        .map_err(LedgerError::from)?
        .is_some();
    if !exists {
        return Err(AppError::not_found("Account", id));
    }

    let records = state
        .accounts
        .list_records(id, query.effective_limit())
        .await
        .map_err(LedgerError::from)?;
    Ok(Json(records))
}
