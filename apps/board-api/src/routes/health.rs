use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub boards: usize,
    pub connections: usize,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let registry = state.hub.registry();
    Json(HealthResponse {
        status: "ok",
        boards: registry.board_count(),
        connections: registry.connection_count(),
    })
}
