//! HTTP handlers for the probe server

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::controller::NodeCache;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub synced: bool,
    pub nodes: usize,
}

/// Liveness endpoint
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness endpoint; ready once the node cache has synced
pub async fn ready(State(cache): State<Arc<NodeCache>>) -> (StatusCode, Json<ReadyResponse>) {
    let synced = cache.has_synced();
    let status = if synced {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadyResponse {
            synced,
            nodes: cache.len(),
        }),
    )
}
