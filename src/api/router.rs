use axum::middleware;
use axum::routing::{delete, get, post, put};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::auth::require_auth;
use super::handlers;
use crate::AppState;

pub fn create_router(state: AppState) -> Router {
    // Public routes, no authentication
    let public = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(handlers::metrics::render));

    // Bearer token required when API_TOKEN is set
    let protected = Router::new()
        // Fleet state
        .route("/api/connection", get(handlers::fleet::connection))
        .route("/api/agents", get(handlers::fleet::agents))
        .route("/api/stats", get(handlers::fleet::stats))
        .route("/api/news", get(handlers::fleet::news))
        .route("/api/prices", get(handlers::fleet::prices))
        // Blackout
        .route("/api/blackout", get(handlers::blackout::status))
        .route(
            "/api/overrides",
            get(handlers::blackout::list_overrides).post(handlers::blackout::enable_override),
        )
        .route("/api/overrides/:symbol", delete(handlers::blackout::disable_override))
        .route("/api/news/config", put(handlers::blackout::configure_impact))
        // Commands
        .route(
            "/api/commands",
            get(handlers::commands::list).post(handlers::commands::enqueue),
        )
        .route("/api/commands/execute", post(handlers::commands::execute))
        .route("/api/commands/preview", post(handlers::commands::preview))
        .route("/api/commands/:id", get(handlers::commands::detail))
        .route("/api/commands/:id/cancel", post(handlers::commands::cancel))
        // WebSocket
        .route("/ws", get(handlers::ws::handler))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    public
        .merge(protected)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
