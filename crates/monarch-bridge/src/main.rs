//! monarch-bridge - keeps a Monarch Money session alive behind a local REST API.
//!
//! On start the persisted session is restored (or a fresh login is made with
//! the configured credentials), a keep-alive task is spawned, and the HTTP
//! surface is served until SIGINT/SIGTERM.

use std::io;
use std::sync::Arc;

use anyhow::{Context, Result};
use monarch_bridge::{create_router, AppState};
use monarch_bridge_core::api::MonarchClient;
use monarch_bridge_core::auth::SessionStore;
use monarch_bridge_core::{Config, KeepAlive, SessionManager};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log file name prefix when `LOG_DIR` is set
const LOG_FILE_PREFIX: &str = "monarch-bridge.log";

/// Initialize the tracing subscriber for logging.
///
/// `RUST_LOG` controls the filter (default `info`). When `LOG_DIR` is set a
/// daily rolling file is written next to stderr output; the returned guard
/// must stay alive for buffered lines to be flushed.
fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match std::env::var("LOG_DIR").ok().filter(|d| !d.is_empty()) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .init();

    guard
}

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
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let _log_guard = init_tracing();
    info!("monarch-bridge starting");

    let config = Config::from_env().context("Invalid configuration")?;
    info!(
        session_file = ?config.session_file,
        keep_alive_secs = config.keep_alive_interval.as_secs(),
        auto_login = config.credentials.is_some(),
        "Configuration loaded"
    );

    let remote = MonarchClient::new(config.api_url.clone(), config.request_timeout)
        .context("Failed to build HTTP client")?;
    let manager = Arc::new(SessionManager::new(
        Arc::new(remote),
        SessionStore::new(&config.session_file),
        config.credentials.clone(),
        config.request_timeout,
    ));

    let state = manager.startup().await;
    info!(?state, "Session lifecycle ready");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let keep_alive = KeepAlive::new(Arc::clone(&manager), config.keep_alive_interval).spawn(shutdown_rx);

    let app = create_router(AppState::new(Arc::clone(&manager)));
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = keep_alive.await {
        warn!(error = %e, "Keep-alive task ended abnormally");
    }
    manager.shutdown().await;

    info!("monarch-bridge shutting down");
    Ok(())
}
