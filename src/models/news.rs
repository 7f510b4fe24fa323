use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImpactLevel {
    High,
    Medium,
    Low,
}

impl fmt::Display for ImpactLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImpactLevel::High => write!(f, "high"),
            ImpactLevel::Medium => write!(f, "medium"),
            ImpactLevel::Low => write!(f, "low"),
        }
    }
}

/// A scheduled market event. Immutable once ingested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsEvent {
    pub id: String,
    pub currency: String,
    /// Extra symbols affected beyond the currency legs, e.g. indices.
    #[serde(default)]
    pub symbols: Vec<String>,
    pub impact_level: ImpactLevel,
    pub event_time: DateTime<Utc>,
    #[serde(default)]
    pub pre_minutes: u32,
    #[serde(default)]
    pub post_minutes: u32,
    #[serde(default)]
    pub description: String,
}

impl NewsEvent {
    /// True if the event's currency is either leg of `symbol` (first six
    /// characters, so broker suffixes like `EURUSD.m` still match) or the
    /// symbol is listed explicitly.
    pub fn affects(&self, symbol: &str) -> bool {
        let symbol = symbol.to_ascii_uppercase();
        if self
            .symbols
            .iter()
            .any(|s| s.eq_ignore_ascii_case(&symbol))
        {
            return true;
        }

        let currency = self.currency.to_ascii_uppercase();
        let base = symbol.get(0..3);
        let quote = symbol.get(3..6);
        base == Some(currency.as_str()) || quote == Some(currency.as_str())
    }
}

/// Blackout margins configured for every event of one impact level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpactMargins {
    pub impact_level: ImpactLevel,
    pub pre_minutes: u32,
    pub post_minutes: u32,
}

/// Operator exception forcing "allowed" for one symbol over `[start_time, end_time)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualOverride {
    pub symbol: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub reason: String,
}

impl ManualOverride {
    pub fn covers(&self, at: DateTime<Utc>) -> bool {
        self.start_time <= at && at < self.end_time
    }
}
