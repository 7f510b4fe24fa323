use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ok, ApiResponse};
use crate::blackout::OverrideAudit;
use crate::errors::AppError;
use crate::execution::SymbolDecision;
use crate::models::{ImpactMargins, ManualOverride};
use crate::services::Applied;
use crate::AppState;

#[derive(Deserialize)]
pub struct BlackoutQuery {
    pub symbols: String,
    /// Defaults to now.
    pub at: Option<DateTime<Utc>>,
}

/// GET /api/blackout?symbols=EURUSD,GBPUSD
pub async fn status(
    State(state): State<AppState>,
    Query(query): Query<BlackoutQuery>,
) -> Result<Json<ApiResponse<Vec<SymbolDecision>>>, AppError> {
    let symbols: Vec<String> = query
        .symbols
        .split(',')
        .map(|s| s.trim().to_ascii_uppercase())
        .filter(|s| !s.is_empty())
        .collect();
    if symbols.is_empty() {
        return Err(AppError::BadRequest("symbols must not be empty".into()));
    }

    let at = query.at.unwrap_or_else(Utc::now);
    let decisions = state
        .store
        .blackout(&symbols, at)
        .await
        .into_iter()
        .map(|(symbol, decision)| SymbolDecision::new(symbol, decision))
        .collect();
    Ok(ok(decisions))
}

#[derive(Serialize)]
pub struct OverridesBody {
    pub active: Vec<ManualOverride>,
    pub history: Vec<OverrideAudit>,
}

pub async fn list_overrides(State(state): State<AppState>) -> Json<ApiResponse<OverridesBody>> {
    ok(OverridesBody {
        active: state.store.overrides().await,
        history: state.store.override_history().await,
    })
}

#[derive(Deserialize)]
pub struct EnableOverrideRequest {
    pub symbol: String,
    pub duration_minutes: u32,
    #[serde(default)]
    pub reason: String,
}

pub async fn enable_override(
    State(state): State<AppState>,
    Json(req): Json<EnableOverrideRequest>,
) -> Result<Json<ApiResponse<Applied<ManualOverride>>>, AppError> {
    let applied = state
        .operator
        .enable_override(&req.symbol, req.duration_minutes, &req.reason)
        .await?;
    Ok(ok(applied))
}

pub async fn disable_override(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> Result<Json<ApiResponse<Applied<ManualOverride>>>, AppError> {
    state
        .operator
        .disable_override(&symbol)
        .await
        .map(ok)
        .ok_or_else(|| AppError::NotFound(format!("no active override for {symbol}")))
}

/// PUT /api/news/config
pub async fn configure_impact(
    State(state): State<AppState>,
    Json(req): Json<ImpactMargins>,
) -> Result<Json<ApiResponse<Applied<ImpactMargins>>>, AppError> {
    let applied = state
        .operator
        .configure_impact(req.impact_level, req.pre_minutes, req.post_minutes)
        .await?;
    Ok(ok(applied))
}
