//! Health check endpoint

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::http::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub connections: usize,
    pub identities: usize,
    pub pending_writes: usize,
    pub relay_subscribed: bool,
}

/// Health check router
pub fn create_health_router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

/// Liveness plus realtime counters
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let metrics = state.hub.metrics();
    Json(HealthResponse {
        status: "ok",
        connections: metrics.connections,
        identities: metrics.identities,
        pending_writes: metrics.pending_writes,
        relay_subscribed: metrics.relay_subscribed,
    })
}
