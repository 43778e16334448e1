//! HTTP trigger surface for the fleet gateway
//!
//! - `POST /api/fleet/apply` - Apply the current configuration (boot)
//! - `POST /api/fleet/refresh` - Reload the configuration and restart the fleet
//! - `GET /api/fleet/status` - Active version and per-camera process state
//! - `GET /health` - Liveness
//! - `GET /metrics` - Gateway metrics

pub mod fleet;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::metrics::MetricsSnapshot;
use crate::runtime::GatewayRuntime;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<GatewayRuntime>,
}

impl AppState {
    pub fn new(runtime: Arc<GatewayRuntime>) -> Self {
        Self { runtime }
    }
}

/// Build the HTTP API router
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/fleet/apply", post(fleet::apply))
        .route("/api/fleet/refresh", post(fleet::refresh))
        .route("/api/fleet/status", get(fleet::status))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

/// Metrics endpoint
async fn metrics_handler(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.runtime.metrics().snapshot())
}
