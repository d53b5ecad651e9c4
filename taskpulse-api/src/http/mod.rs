// HTTP API

pub mod error;
pub mod health;
pub mod middleware;
pub mod tasks;
pub mod websocket;

use axum::{
    routing::{get, patch},
    Router,
};
use std::sync::Arc;
use taskpulse_cluster::RealtimeHub;
use taskpulse_core::IdentityVerifier;
use tower_http::trace::TraceLayer;

pub use error::{AppError, AppResult};
pub use middleware::AuthUser;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<RealtimeHub>,
    pub verifier: Arc<dyn IdentityVerifier>,
}

impl AppState {
    #[must_use]
    pub fn new(hub: Arc<RealtimeHub>, verifier: Arc<dyn IdentityVerifier>) -> Self {
        Self { hub, verifier }
    }
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check endpoints (for monitoring probes)
        .merge(health::create_health_router())
        // Realtime channel
        .route("/ws", get(websocket::websocket_handler))
        // Mutations routed through the write coalescer
        .route("/tasks/{id}", patch(tasks::update_task))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
