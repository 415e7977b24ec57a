//! # Keel Server
//!
//! HTTP server for the Keel ERP inventory and order engine.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Keel Server                                    │
//! │                                                                         │
//! │  clients ───► HTTP (8080) ───► axum Router ───► Engine ───► SQLite     │
//! │                                                   │                     │
//! │                                                   ▼                     │
//! │                                    alert workers, expiry sweeper        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Configuration comes from `keel.toml` (or the path in `KEEL_CONFIG`) with
//! `KEEL_*` environment overrides; logging honours `RUST_LOG`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use keel_db::Database;
use keel_engine::{Engine, EngineConfig};
use keel_server::{router, AppState};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info,keel=debug";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_target(true)
        .init();

    info!("Starting Keel server...");

    let config_path = std::env::var_os("KEEL_CONFIG").map(PathBuf::from);
    let config = EngineConfig::load(config_path).context("loading configuration")?;
    let addr = config.server.bind_address();
    info!(
        %addr,
        database = %config.database.path,
        approval_threshold = config.ledger.approval_threshold,
        "Configuration loaded"
    );

    let db = Database::new(config.database.db_config())
        .await
        .context("opening database")?;
    info!("Database ready");

    let engine = Arc::new(Engine::new(config, db).context("building engine")?);
    engine.start();

    let state = AppState::new(Arc::clone(&engine));
    let shutdown = state.shutdown.clone();
    let app = router(state);

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!(%addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown.cancel();
        })
        .await
        .context("serving HTTP")?;

    engine.shutdown().await;
    engine.db.close().await;
    info!("Server shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown...");
}
