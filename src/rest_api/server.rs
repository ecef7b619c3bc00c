//! Axum HTTP server for probes and metrics

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Router};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::controller::NodeCache;
use crate::{Error, Result};

use super::handlers;

/// Metrics endpoint handler
#[cfg(feature = "metrics")]
async fn metrics_handler() -> std::result::Result<String, axum::http::StatusCode> {
    use prometheus_client::encoding::text::encode;
    let mut buffer = String::new();
    encode(&mut buffer, &crate::controller::metrics::REGISTRY)
        .map_err(|_| axum::http::StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(buffer)
}

pub(crate) fn router(cache: Arc<NodeCache>) -> Router {
    let app = Router::new()
        .route("/healthz", get(handlers::health))
        .route("/readyz", get(handlers::ready));

    #[cfg(feature = "metrics")]
    let app = app.route("/metrics", get(metrics_handler));

    app.layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(cache)
}

/// Run the probe server until the task is dropped
pub async fn run_server(addr: SocketAddr, cache: Arc<NodeCache>) -> Result<()> {
    let app = router(cache);

    info!("Probe server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind to {}: {}", addr, e)))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| Error::ConfigError(format!("Server error: {}", e)))?;

    Ok(())
}
