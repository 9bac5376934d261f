// src/server/mod.rs

use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::info;

use crate::config::Config;

mod metrics_server;
mod range;
mod routes;
mod state;

pub use state::AppState;

/// Wires up the cache, fetch coordinator, registry tracker, metrics server,
/// and main HTTP server, then runs until a shutdown signal is received.
pub async fn run(config: Config) -> Result<()> {
    tokio::fs::create_dir_all(&config.cache.root).await?;
    tokio::fs::create_dir_all(&config.cache.temp_root).await?;

    let host = config.host.clone();
    let port = config.port;
    let metrics_config = config.metrics.clone();
    let poll_interval = Duration::from_secs(config.registry_poll_interval_secs);

    let app_state = AppState::new(config);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let tracker = app_state.registry_tracker.clone();
    let tracker_shutdown = shutdown_tx.subscribe();
    tokio::spawn(async move {
        tracker.run(poll_interval, tracker_shutdown).await;
    });

    if metrics_config.enabled {
        let metrics_shutdown = shutdown_tx.subscribe();
        let metrics_host = host.clone();
        tokio::spawn(async move {
            if let Err(e) =
                metrics_server::run_metrics_server(metrics_host, metrics_config.port, metrics_shutdown)
                    .await
            {
                tracing::error!(error = %e, "metrics server exited with error");
            }
        });
    }

    let app = routes::router(app_state);
    let listener = TcpListener::bind((host.as_str(), port)).await?;
    info!(host, port, "pkgvault listening");

    let mut shutdown_rx = shutdown_tx.subscribe();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = shutdown_rx.recv() => {}
            }
        })
        .await?;

    Ok(())
}
