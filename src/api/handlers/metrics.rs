use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use metrics::gauge;

use crate::AppState;

/// Prometheus scrape endpoint. Store-derived gauges are refreshed here so a
/// scrape never lags what the API would return.
pub async fn render(State(state): State<AppState>) -> impl IntoResponse {
    gauge!("agents_tracked").set(state.store.agents().await.len() as f64);
    gauge!("command_queue_pending").set(state.queue.pending_count().await as f64);

    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics_handle.render(),
    )
}
