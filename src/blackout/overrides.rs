use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::ManualOverride;

const MAX_HISTORY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideEndCause {
    Replaced,
    Disabled,
    Expired,
}

/// A retired override, kept so replacements are never silently lost.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverrideAudit {
    #[serde(rename = "override")]
    pub ended: ManualOverride,
    pub cause: OverrideEndCause,
    pub ended_at: DateTime<Utc>,
}

/// At most one active override per symbol, plus a bounded audit trail.
#[derive(Debug, Clone, Default)]
pub struct OverrideBook {
    active: HashMap<String, ManualOverride>,
    history: VecDeque<OverrideAudit>,
}

impl OverrideBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `ov` for its symbol, returning the override it replaced.
    pub fn enable(&mut self, ov: ManualOverride, now: DateTime<Utc>) -> Option<ManualOverride> {
        let symbol = ov.symbol.to_ascii_uppercase();
        let replaced = self.active.insert(symbol, ov);
        if let Some(old) = &replaced {
            tracing::info!(
                symbol = %old.symbol,
                old_reason = %old.reason,
                old_end = %old.end_time,
                "Manual override replaced"
            );
            self.retire(old.clone(), OverrideEndCause::Replaced, now);
        }
        replaced
    }

    pub fn disable(&mut self, symbol: &str, now: DateTime<Utc>) -> Option<ManualOverride> {
        let removed = self.active.remove(&symbol.to_ascii_uppercase());
        if let Some(old) = &removed {
            self.retire(old.clone(), OverrideEndCause::Disabled, now);
        }
        removed
    }

    /// Drop overrides whose window has ended.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Vec<ManualOverride> {
        let expired: Vec<String> = self
            .active
            .iter()
            .filter(|(_, ov)| ov.end_time <= now)
            .map(|(symbol, _)| symbol.clone())
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for symbol in expired {
            if let Some(ov) = self.active.remove(&symbol) {
                self.retire(ov.clone(), OverrideEndCause::Expired, now);
                removed.push(ov);
            }
        }
        removed
    }

    /// The override for `symbol` if it covers `at`.
    pub fn active_for(&self, symbol: &str, at: DateTime<Utc>) -> Option<&ManualOverride> {
        self.active
            .get(&symbol.to_ascii_uppercase())
            .filter(|ov| ov.covers(at))
    }

    pub fn active(&self) -> Vec<ManualOverride> {
        let mut all: Vec<ManualOverride> = self.active.values().cloned().collect();
        all.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        all
    }

    pub fn history(&self) -> Vec<OverrideAudit> {
        self.history.iter().cloned().collect()
    }

    fn retire(&mut self, ended: ManualOverride, cause: OverrideEndCause, now: DateTime<Utc>) {
        if self.history.len() == MAX_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(OverrideAudit {
            ended,
            cause,
            ended_at: now,
        });
    }
}
