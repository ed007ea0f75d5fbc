//! Quota ledger HTTP server.
//!
//! Idempotent, concurrency-safe balance and quota mutations over `PostgreSQL`.

use axum::{Router, routing::get};
use quota_ledger_core::environment::SystemClock;
use quota_ledger_postgres::PostgresStore;
use quota_ledger_runtime::LedgerEngine;
use quota_ledger_runtime::metrics::MetricsServer;
use quota_ledger_server::Config;
use quota_ledger_web::{AppState, router};
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Missing .env is fine in production
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,quota_ledger=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting quota ledger server");

    let config = Config::from_env()?;
    info!(
        strategy = %config.engine.strategy,
        max_attempts = config.engine.retry.max_attempts(),
        lock_timeout_ms = u64::try_from(config.postgres.lock_timeout.as_millis()).unwrap_or(u64::MAX),
        "Configuration loaded"
    );

    // Metrics
    let mut metrics = MetricsServer::new(config.server.metrics_addr()?);
    metrics.start()?;
    if let Some(handle) = metrics.handle().cloned() {
        let metrics_app = Router::new().route(
            "/metrics",
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        );
        let listener = tokio::net::TcpListener::bind(metrics.addr()).await?;
        info!(address = %metrics.addr(), "Metrics endpoint listening");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, metrics_app).await {
                error!(error = %e, "Metrics endpoint stopped");
            }
        });
    }

    // Store
    info!("Connecting to database...");
    let store = Arc::new(PostgresStore::connect(&config.postgres).await?);
    info!("Database connected");

    if config.run_migrations {
        store.migrate().await?;
        info!("Migrations applied");
    }

    let clock = Arc::new(SystemClock);
    let engine = LedgerEngine::new(store.clone(), clock.clone(), config.engine);
    let app = router(AppState::new(engine, store, clock));

    let addr = config.server.addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %addr, "Server listening");

    // Run server with graceful shutdown, bounded by SHUTDOWN_TIMEOUT
    let (stopping_tx, mut stopping_rx) = tokio::sync::watch::channel(false);
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = stopping_tx.send(true);
        })
        .into_future();
    let drain_limit = Duration::from_secs(config.server.shutdown_timeout);
    let drain_deadline = async move {
        let _ = stopping_rx.wait_for(|stopping| *stopping).await;
        tokio::time::sleep(drain_limit).await;
    };

    tokio::select! {
        result = server => result?,
        () = drain_deadline => {
            warn!(timeout_secs = drain_limit.as_secs(), "Shutdown timeout elapsed, dropping in-flight requests");
        },
    }

    info!("Server stopped");
    Ok(())
}

/// Graceful shutdown signal handler.
///
/// Waits for:
/// - Ctrl+C (SIGINT)
/// - SIGTERM (in production environments)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal, shutting down gracefully...");
        },
        () = terminate => {
            info!("Received SIGTERM signal, shutting down gracefully...");
        },
    }
}
