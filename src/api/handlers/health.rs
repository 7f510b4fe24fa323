use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::AppState;

/// Liveness plus the push channel phase. Always 200: a lost push channel is
/// a degraded mode, not an outage.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let connection = state.connection.borrow().clone();
    let status = if connection.is_connected() {
        "healthy"
    } else {
        "degraded"
    };

    Json(json!({
        "status": status,
        "push_channel": connection.phase,
        "journal": state.config.database_url.is_some(),
    }))
}
