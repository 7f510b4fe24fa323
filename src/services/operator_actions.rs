use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Serialize;

use crate::errors::{BackendError, ValidationError};
use crate::models::{ImpactLevel, ImpactMargins, ManualOverride};
use crate::state::{Delta, StateStore};

/// Upper bound for impact margins, one day either side of an event.
pub const MAX_MARGIN_MINUTES: u32 = 1440;
/// Longest manual override an operator may grant in one go.
pub const MAX_OVERRIDE_MINUTES: u32 = 7 * 1440;

/// Collaborator endpoints that mirror blackout configuration.
#[async_trait]
pub trait BlackoutControl: Send + Sync {
    async fn push_override(&self, ov: &ManualOverride, duration_minutes: u32) -> Result<(), BackendError>;
    async fn push_override_removal(&self, symbol: &str) -> Result<(), BackendError>;
    async fn push_impact_margins(&self, margins: &ImpactMargins) -> Result<(), BackendError>;
}

/// Outcome of an operator action. The local store is authoritative;
/// `backend_synced` only says whether the collaborator accepted the mirror.
#[derive(Debug, Clone, Serialize)]
pub struct Applied<T> {
    pub result: T,
    pub backend_synced: bool,
}

/// Operator-side mutations of blackout state. Every change goes through the
/// store as a delta; the collaborator is told afterwards, best effort.
pub struct OperatorActions {
    store: Arc<StateStore>,
    backend: Option<Arc<dyn BlackoutControl>>,
}

impl OperatorActions {
    pub fn new(store: Arc<StateStore>, backend: Option<Arc<dyn BlackoutControl>>) -> Self {
        Self { store, backend }
    }

    pub async fn enable_override(
        &self,
        symbol: &str,
        duration_minutes: u32,
        reason: &str,
    ) -> Result<Applied<ManualOverride>, ValidationError> {
        let symbol = symbol.trim().to_ascii_uppercase();
        if symbol.is_empty() {
            return Err(ValidationError::InvalidParameter {
                field: "symbol",
                reason: "must not be empty".into(),
            });
        }
        if duration_minutes == 0 || duration_minutes > MAX_OVERRIDE_MINUTES {
            return Err(ValidationError::InvalidParameter {
                field: "duration_minutes",
                reason: format!("must be between 1 and {MAX_OVERRIDE_MINUTES}"),
            });
        }

        let now = Utc::now();
        let ov = ManualOverride {
            symbol: symbol.clone(),
            start_time: now,
            end_time: now + Duration::minutes(i64::from(duration_minutes)),
            reason: reason.to_string(),
        };
        self.store.apply_delta(Delta::OverrideEnabled(ov.clone())).await;
        tracing::info!(
            symbol = %symbol,
            until = %ov.end_time,
            reason = %reason,
            "Manual override enabled"
        );

        let backend_synced = match &self.backend {
            Some(b) => synced("enable_override", b.push_override(&ov, duration_minutes).await),
            None => false,
        };
        Ok(Applied {
            result: ov,
            backend_synced,
        })
    }

    /// `None` when the symbol had no active override.
    pub async fn disable_override(&self, symbol: &str) -> Option<Applied<ManualOverride>> {
        let symbol = symbol.trim().to_ascii_uppercase();
        let removed = self
            .store
            .apply_delta(Delta::OverrideDisabled {
                symbol: symbol.clone(),
            })
            .await
            .disabled?;
        tracing::info!(symbol = %symbol, reason = %removed.reason, "Manual override disabled");

        let backend_synced = match &self.backend {
            Some(b) => synced("disable_override", b.push_override_removal(&symbol).await),
            None => false,
        };
        Some(Applied {
            result: removed,
            backend_synced,
        })
    }

    pub async fn configure_impact(
        &self,
        impact_level: ImpactLevel,
        pre_minutes: u32,
        post_minutes: u32,
    ) -> Result<Applied<ImpactMargins>, ValidationError> {
        for (field, value) in [("pre_minutes", pre_minutes), ("post_minutes", post_minutes)] {
            if value > MAX_MARGIN_MINUTES {
                return Err(ValidationError::InvalidParameter {
                    field,
                    reason: format!("{value} exceeds {MAX_MARGIN_MINUTES}"),
                });
            }
        }

        let margins = ImpactMargins {
            impact_level,
            pre_minutes,
            post_minutes,
        };
        self.store
            .apply_delta(Delta::ImpactMargins(vec![margins]))
            .await;
        tracing::info!(
            impact = %impact_level,
            pre_minutes,
            post_minutes,
            "Impact margins configured"
        );

        let backend_synced = match &self.backend {
            Some(b) => synced("configure_impact", b.push_impact_margins(&margins).await),
            None => false,
        };
        Ok(Applied {
            result: margins,
            backend_synced,
        })
    }
}

fn synced(action: &'static str, result: Result<(), BackendError>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(action, error = %e, "Backend did not accept blackout change");
            false
        }
    }
}
