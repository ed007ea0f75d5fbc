//! Error types for web handlers.
//!
//! [`AppError`] bridges [`LedgerError`] and HTTP responses: every ledger
//! outcome maps to a status code and the stable machine code from
//! [`LedgerError::code`].

use axum::{
    Json,
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use quota_ledger_core::error::LedgerError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Message returned for every transient contention failure.
pub const BUSY_MESSAGE: &str = "system busy, please try again";

/// Application error type for web handlers.
///
/// # Examples
///
/// ```ignore
/// async fn handler(State(state): State<AppState>) -> Result<Json<Account>, AppError> {
///     let account = state.accounts.get_account(id).await.map_err(LedgerError::from)?
///         .ok_or_else(|| AppError::not_found("Account", id))?;
///     Ok(Json(account))
/// }
/// ```
#[derive(Debug)]
pub struct AppError {
    /// HTTP status code
    status: StatusCode,
    /// Error message (user-facing)
    message: String,
    /// Error code (for client error handling)
    code: String,
    /// Internal error (for logging, not exposed to client)
    source: Option<anyhow::Error>,
}

impl AppError {
    /// Create a new application error.
    #[must_use]
    pub const fn new(status: StatusCode, message: String, code: String) -> Self {
        Self {
            status,
            message,
            code,
            source: None,
        }
    }

    /// Create a new error with a source error.
    #[must_use]
    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }

    /// Create a 400 Bad Request error.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            message.into(),
            "BAD_REQUEST".to_string(),
        )
    }

    /// Create a 404 Not Found error.
    #[must_use]
    pub fn not_found(resource: impl fmt::Display, id: impl fmt::Display) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            format!("{resource} with id {id} not found"),
            "NOT_FOUND".to_string(),
        )
    }

    /// Create a 500 Internal Server Error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            message.into(),
            "INTERNAL_SERVER_ERROR".to_string(),
        )
    }

    /// HTTP status this error renders with
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Machine-readable error code
    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Error response body (JSON).
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error code (for client error handling).
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            if let Some(source) = &self.source {
                tracing::error!(
                    status = %self.status,
                    code = %self.code,
                    message = %self.message,
                    error = %source,
                    "Internal server error"
                );
            } else {
                tracing::warn!(
                    status = %self.status,
                    code = %self.code,
                    message = %self.message,
                    "Request failed"
                );
            }
        }

        metrics::counter!(
            "http_errors_total",
            "status" => self.status.as_u16().to_string(),
            "code" => self.code.clone()
        )
        .increment(1);

        let body = ErrorResponse {
            code: self.code,
            message: self.message,
        };

        (self.status, Json(body)).into_response()
    }
}

/// Convert `anyhow::Error` to `AppError`.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal("An internal error occurred").with_source(err)
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<PathRejection> for AppError {
    fn from(rejection: PathRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        let code = err.code().to_string();
        match err {
            LedgerError::InvalidAmount(_)
            | LedgerError::InvalidIntent(_)
            | LedgerError::InvalidIdempotencyKey(_)
            | LedgerError::InsufficientResource { .. } => {
                Self::new(StatusCode::BAD_REQUEST, err.to_string(), code)
            }
            LedgerError::AccountNotFound(_) => Self::new(StatusCode::NOT_FOUND, err.to_string(), code),
            LedgerError::AccountAlreadyExists(_) => {
                Self::new(StatusCode::CONFLICT, err.to_string(), code)
            }
            LedgerError::RetriesExhausted { .. }
            | LedgerError::WriteConflict(_)
            | LedgerError::LockTimeout(_) => {
                tracing::debug!(error = %err, "Contention surfaced to caller");
                Self::new(StatusCode::SERVICE_UNAVAILABLE, BUSY_MESSAGE.to_string(), code)
            }
            LedgerError::Store(_) => Self::internal("An internal error occurred")
                .with_source(anyhow::Error::new(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quota_ledger_core::error::StoreError;
    use quota_ledger_core::types::{AccountId, OwnerId};

    #[test]
    fn test_error_display() {
        let err = AppError::bad_request("Invalid input");
        assert_eq!(err.to_string(), "[BAD_REQUEST] Invalid input");
    }

    #[test]
    fn test_not_found() {
        let err = AppError::not_found("Account", "123");
        assert_eq!(err.to_string(), "[NOT_FOUND] Account with id 123 not found");
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_caller_errors_are_bad_requests() {
        let insufficient = AppError::from(LedgerError::InsufficientResource {
            account_id: AccountId::new(),
            level: 10,
            requested: 50,
        });
        assert_eq!(insufficient.status(), StatusCode::BAD_REQUEST);
        assert_eq!(insufficient.code(), "INSUFFICIENT_RESOURCE");

        let intent = AppError::from(LedgerError::InvalidIntent("REFUND".into()));
        assert_eq!(intent.status(), StatusCode::BAD_REQUEST);
        assert_eq!(intent.code(), "INVALID_INTENT");
    }

    #[test]
    fn test_contention_is_service_unavailable() {
        let exhausted = AppError::from(LedgerError::RetriesExhausted {
            attempts: 3,
            last: Box::new(LedgerError::WriteConflict("row changed".into())),
        });
        assert_eq!(exhausted.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(exhausted.code(), "RETRIES_EXHAUSTED");
        assert_eq!(exhausted.message, BUSY_MESSAGE);

        let timeout = AppError::from(LedgerError::LockTimeout("2s".into()));
        assert_eq!(timeout.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_lookup_and_provisioning_errors() {
        let missing = AppError::from(LedgerError::AccountNotFound(AccountId::new()));
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let duplicate = AppError::from(LedgerError::AccountAlreadyExists(OwnerId::new()));
        assert_eq!(duplicate.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_extractor_rejections_are_bad_requests() {
        let rejection = JsonRejection::from(axum::extract::rejection::MissingJsonContentType::default());
        let err = AppError::from(rejection);
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "BAD_REQUEST");
        assert!(err.message.contains("Content-Type"));
    }

    #[test]
    fn test_store_failure_hides_detail() {
        let err = AppError::from(LedgerError::Store(StoreError::Database(
            "password authentication failed".into(),
        )));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.to_string().contains("password"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
