use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::state::AppState;
use crate::error::Result;
use crate::types::{HealthReport, StatusSnapshot};

/// Build the poll router: `GET /status` and `GET /health`.
pub fn build(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /status - Current session status, read from memory.
async fn status_handler(State(state): State<AppState>) -> Result<Json<StatusSnapshot>> {
    Ok(Json(state.source.status_snapshot()?))
}

/// GET /health - Liveness and identity of this instance.
async fn health_handler(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.health())
}
