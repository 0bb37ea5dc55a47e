//! Prometheus exporter.
//!
//! Installs the global recorder and serves it over HTTP for scrapes taken
//! while a run is in progress:
//! - `/metrics`: Prometheus text format
//! - `/health`: liveness check

use axum::{Router, extract::State, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use snafu::prelude::*;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, error};

use crate::error::{MetricsError, PrometheusInitSnafu};

/// Install the recorder and spawn the HTTP endpoint on `addr`.
pub fn init(addr: SocketAddr) -> Result<PrometheusHandle, MetricsError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context(PrometheusInitSnafu)?;

    tokio::spawn(serve(addr, handle.clone()));
    Ok(handle)
}

fn router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/metrics", get(render))
        .route("/health", get(|| async { "ok\n" }))
        .with_state(handle)
}

async fn serve(addr: SocketAddr, handle: PrometheusHandle) {
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind metrics endpoint to {}: {}", addr, e);
            return;
        }
    };
    debug!("Metrics endpoint listening on http://{}/metrics", addr);

    if let Err(e) = axum::serve(listener, router(handle)).await {
        error!("Metrics endpoint stopped: {}", e);
    }
}

async fn render(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}
