use axum::{extract::State, Json};
use serde::Serialize;
use tracing::instrument;

use crate::db::ConnectionStatus;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: ConnectionStatus,
}

/// Liveness plus the database connection snapshot; 200 even while the
/// database is down.
#[instrument(skip(state))]
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        database: state.db.get_connection_status(),
    })
}
