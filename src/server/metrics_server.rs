// src/server/metrics_server.rs

//! A small side-channel Axum server exposing `/metrics` for Prometheus scrape,
//! bound on its own port so it can be firewalled off separately from the main
//! resource-serving surface.

use anyhow::Result;
use axum::Router;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::info;

use crate::core::metrics::gather_metrics;

async fn metrics_handler() -> (axum::http::StatusCode, [(&'static str, &'static str); 1], String) {
    (
        axum::http::StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        gather_metrics(),
    )
}

pub async fn run_metrics_server(
    host: String,
    port: u16,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let app = Router::new().route("/metrics", get(metrics_handler));
    let listener = TcpListener::bind((host.as_str(), port)).await?;
    info!(host, port, "metrics server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
        })
        .await?;
    Ok(())
}
