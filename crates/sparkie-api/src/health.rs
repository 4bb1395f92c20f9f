use axum::{Json, extract::State};
use tracing::error;

use sparkie_types::api::HealthResponse;

use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let (status, database) = match state.with_db(|db| db.ping()).await {
        Ok(()) => ("healthy", "connected"),
        Err(e) => {
            error!("Health check database ping failed: {}", e);
            ("degraded", "unavailable")
        }
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        service: "Sparkie API".to_string(),
        database: database.to_string(),
    })
}
