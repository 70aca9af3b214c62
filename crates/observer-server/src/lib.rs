//! HTTP server that receives agent metrics and stores them.

pub mod api;
pub mod app;
pub mod config;
pub mod logging;
pub mod middleware;
pub mod state;

use anyhow::{Context, Result};
use observer_storage::open_storage;
use std::future::Future;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub use config::{ServerArgs, ServerConfig};
pub use state::AppState;

/// Opens storage, serves on `listener` until `shutdown_signal` resolves, and
/// closes storage.
///
/// In-flight storage calls are cancelled as soon as the signal fires; the
/// listener then drains open connections before storage is closed.
pub async fn serve<F>(listener: TcpListener, config: ServerConfig, shutdown_signal: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let storage = open_storage(&config.storage_config())
        .await
        .context("opening storage")?;
    let shutdown = CancellationToken::new();
    let state = AppState::new(storage.clone(), config, shutdown.clone())?;
    let app = app::build_http_app(state);

    tracing::info!(
        addr = %listener.local_addr().context("reading listen address")?,
        backend = storage.backend(),
        "Server started"
    );

    let token = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal.await;
            tracing::info!("Shutting down gracefully");
            token.cancel();
        })
        .await;
    if let Err(e) = &served {
        tracing::error!(error = %e, "HTTP server error");
    }

    if let Err(e) = storage.close().await {
        tracing::error!(backend = storage.backend(), error = %e, "Failed to close storage");
    }
    tracing::info!("Server stopped");
    served.context("serving HTTP")
}
