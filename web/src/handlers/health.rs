//! Health check endpoint.
//!
//! Used by load balancers and monitoring systems to verify the process is
//! serving requests.

use axum::http::StatusCode;

/// Liveness probe.
///
/// Does NOT check the database: a slow pool should not take the process out
/// of rotation.
///
/// # Endpoint
///
/// ```text
/// GET /health
/// ```
#[allow(clippy::unused_async)]
pub async fn health_check() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}
