//! Prometheus metrics for the ledger.
//!
//! This module provides metric collection for:
//! - Mutation outcomes and latency
//! - Idempotent replays
//! - Retry attempts and exhaustion
//!
//! # Example
//!
//! ```rust,no_run
//! use quota_ledger_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Render for a scrape endpoint
//! let body = server.render().unwrap_or_default();
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics recorder and scrape handle.
///
/// Installs the global recorder; the owner serves [`MetricsServer::render`]
/// on [`MetricsServer::addr`].
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address the scrape endpoint should bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Address the scrape endpoint should bind to.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Register metric descriptions and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g., in tests), this logs a warning
    /// and leaves [`handle`](Self::handle) empty.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                register_metrics();
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if the recorder was not installed by this server.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Ledger Metrics
    describe_counter!(
        "ledger_mutations_total",
        "Total number of mutation attempts by outcome"
    );
    describe_counter!(
        "ledger_replays_total",
        "Total number of attempts answered from an existing record"
    );
    describe_histogram!(
        "ledger_apply_duration_seconds",
        "Time taken by a single mutation attempt"
    );

    // Retry Metrics
    describe_counter!("retry_attempts_total", "Total number of retry attempts");
    describe_counter!(
        "retry_successes_total",
        "Total number of operations that succeeded after at least one retry"
    );
    describe_counter!(
        "retry_exhausted_total",
        "Total number of operations that ran out of attempts"
    );

    // Transport Metrics
    describe_counter!(
        "http_errors_total",
        "Total number of error responses by status and code"
    );
}

/// Ledger engine metrics recorder.
pub struct LedgerMetrics;

impl LedgerMetrics {
    /// Record the outcome of one attempt (`succeeded`, `replayed`, or an error code).
    pub fn record_outcome(outcome: &'static str, duration: Duration) {
        counter!("ledger_mutations_total", "outcome" => outcome).increment(1);
        histogram!("ledger_apply_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record an attempt answered from an existing record.
    pub fn record_replay() {
        counter!("ledger_replays_total").increment(1);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!("retry_attempts_total").increment(1);
    }

    /// Record a successful retry.
    pub fn record_success() {
        counter!("retry_successes_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("retry_exhausted_total").increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_server_creation() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert!(server.handle().is_none());
        assert_eq!(server.addr(), addr);
    }

    #[test]
    fn test_metrics_server_render() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);
        server.start().unwrap();

        LedgerMetrics::record_outcome("succeeded", Duration::from_millis(3));
        LedgerMetrics::record_replay();
        RetryMetrics::record_attempt();

        // Another test may own the global recorder; metrics still record there.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("ledger_mutations_total"));
            assert!(rendered.contains("ledger_replays_total"));
            assert!(rendered.contains("retry_attempts_total"));
        }
    }
}
