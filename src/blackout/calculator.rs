use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::overrides::OverrideBook;
use crate::models::{ImpactLevel, ImpactMargins, NewsEvent};

/// Margins configured per impact level. A configured level supersedes the
/// margins carried on individual events of that level.
#[derive(Debug, Clone, Default)]
pub struct ImpactConfig {
    margins: HashMap<ImpactLevel, ImpactMargins>,
}

impl ImpactConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// `false` when the level already had exactly these margins.
    pub fn set(&mut self, margins: ImpactMargins) -> bool {
        self.margins.insert(margins.impact_level, margins) != Some(margins)
    }

    /// `(pre_minutes, post_minutes)` that apply to `event`.
    pub fn margins_for(&self, event: &NewsEvent) -> (u32, u32) {
        match self.margins.get(&event.impact_level) {
            Some(m) => (m.pre_minutes, m.post_minutes),
            None => (event.pre_minutes, event.post_minutes),
        }
    }

    pub fn all(&self) -> Vec<ImpactMargins> {
        let mut all: Vec<ImpactMargins> = self.margins.values().copied().collect();
        all.sort_by_key(|m| m.impact_level as u8);
        all
    }
}

impl FromIterator<ImpactMargins> for ImpactConfig {
    fn from_iter<I: IntoIterator<Item = ImpactMargins>>(iter: I) -> Self {
        let mut config = ImpactConfig::new();
        for m in iter {
            config.set(m);
        }
        config
    }
}

/// Why a symbol is blocked: the earliest-starting event whose window holds
/// the instant, and the end of the merged run of overlapping windows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockReason {
    pub event_id: String,
    pub currency: String,
    pub impact_level: ImpactLevel,
    pub description: String,
    pub window_start: DateTime<Utc>,
    pub blocked_until: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum BlackoutDecision {
    Allowed,
    /// Allowed only because an override covers the instant. `suppressed`
    /// records the block the override cancelled, if there was one.
    OverrideAllowed {
        reason: String,
        override_until: DateTime<Utc>,
        suppressed: Option<BlockReason>,
    },
    Blocked(BlockReason),
}

impl BlackoutDecision {
    pub fn trading_allowed(&self) -> bool {
        !matches!(self, BlackoutDecision::Blocked(_))
    }

    pub fn reason(&self) -> String {
        match self {
            BlackoutDecision::Allowed => "no blackout".into(),
            BlackoutDecision::OverrideAllowed { reason, .. } => format!("manual override: {reason}"),
            BlackoutDecision::Blocked(block) => format!(
                "{} impact {} event '{}' blocks until {}",
                block.impact_level, block.currency, block.description, block.blocked_until
            ),
        }
    }
}

/// Blackout window of `event` as the half-open interval `[start, end)`.
/// Zero margins give an empty window.
pub fn blackout_window(event: &NewsEvent, config: &ImpactConfig) -> (DateTime<Utc>, DateTime<Utc>) {
    let (pre, post) = config.margins_for(event);
    (
        event.event_time - Duration::minutes(i64::from(pre)),
        event.event_time + Duration::minutes(i64::from(post)),
    )
}

/// Block computed from events alone, ignoring overrides.
pub fn computed_block(
    symbol: &str,
    at: DateTime<Utc>,
    events: &[NewsEvent],
    config: &ImpactConfig,
) -> Option<BlockReason> {
    let windows: Vec<(DateTime<Utc>, DateTime<Utc>, &NewsEvent)> = events
        .iter()
        .filter(|e| e.affects(symbol))
        .map(|e| {
            let (start, end) = blackout_window(e, config);
            (start, end, e)
        })
        .filter(|(start, end, _)| start < end)
        .collect();

    let first = windows
        .iter()
        .filter(|(start, end, _)| *start <= at && at < *end)
        .min_by_key(|(start, _, e)| (*start, e.id.clone()))?;

    // Union with every window chained to this one so `blocked_until` is the
    // first instant trading is actually allowed again.
    let (mut lo, mut hi) = (first.0, first.1);
    loop {
        let mut grew = false;
        for (start, end, _) in &windows {
            if *start <= hi && *end >= lo && (*start < lo || *end > hi) {
                lo = lo.min(*start);
                hi = hi.max(*end);
                grew = true;
            }
        }
        if !grew {
            break;
        }
    }

    let event = first.2;
    Some(BlockReason {
        event_id: event.id.clone(),
        currency: event.currency.clone(),
        impact_level: event.impact_level,
        description: event.description.clone(),
        window_start: lo,
        blocked_until: hi,
    })
}

/// The single effective decision for `symbol` at `at`. An override covering
/// `at` wins over any computed block.
pub fn is_allowed(
    symbol: &str,
    at: DateTime<Utc>,
    events: &[NewsEvent],
    config: &ImpactConfig,
    overrides: &OverrideBook,
) -> BlackoutDecision {
    let block = computed_block(symbol, at, events, config);

    if let Some(ov) = overrides.active_for(symbol, at) {
        return BlackoutDecision::OverrideAllowed {
            reason: ov.reason.clone(),
            override_until: ov.end_time,
            suppressed: block,
        };
    }

    match block {
        Some(block) => BlackoutDecision::Blocked(block),
        None => BlackoutDecision::Allowed,
    }
}
