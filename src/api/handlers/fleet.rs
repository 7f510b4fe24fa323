use axum::extract::State;
use axum::Json;
use serde::Serialize;

use super::{ok, ApiResponse};
use crate::models::{AccountSummary, Agent, ConnectionState, GlobalStats, NewsEvent, PriceTick};
use crate::AppState;

pub async fn connection(State(state): State<AppState>) -> Json<ApiResponse<ConnectionState>> {
    ok(state.connection.borrow().clone())
}

pub async fn agents(State(state): State<AppState>) -> Json<ApiResponse<Vec<Agent>>> {
    ok(state.store.agents().await)
}

#[derive(Serialize)]
pub struct StatsBody {
    pub version: u64,
    pub stats: GlobalStats,
    pub account: Option<AccountSummary>,
}

/// GET /api/stats: aggregates derived from one consistent view of agents.
pub async fn stats(State(state): State<AppState>) -> Json<ApiResponse<StatsBody>> {
    let view = state.store.view().await;
    ok(StatsBody {
        version: view.version,
        stats: view.stats,
        account: view.account,
    })
}

pub async fn news(State(state): State<AppState>) -> Json<ApiResponse<Vec<NewsEvent>>> {
    ok(state.store.news_events().await)
}

/// GET /api/prices: last tick per subscribed symbol.
pub async fn prices(State(state): State<AppState>) -> Json<ApiResponse<Vec<PriceTick>>> {
    ok(state.store.prices().await)
}
