use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of an EA instance. Two instances may share a magic number
/// (same strategy loaded on two terminals), so the uuid is part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentKey {
    pub magic_number: i64,
    pub instance_uuid: String,
}

impl AgentKey {
    pub fn new(magic_number: i64, instance_uuid: impl Into<String>) -> Self {
        Self {
            magic_number,
            instance_uuid: instance_uuid.into(),
        }
    }
}

impl fmt::Display for AgentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ea_{}_{}", self.magic_number, self.instance_uuid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Paused,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentStatus::Active => write!(f, "active"),
            AgentStatus::Paused => write!(f, "paused"),
        }
    }
}

/// Last known state of one EA, as reported by the agent itself.
///
/// `last_seen` doubles as the recency signal for merging: the store only
/// keeps the record with the greatest `last_seen` per identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub magic_number: i64,
    pub instance_uuid: String,
    pub symbol: String,
    #[serde(default)]
    pub strategy_tag: String,
    pub status: AgentStatus,
    #[serde(default)]
    pub open_positions: u32,
    #[serde(default)]
    pub profit: Decimal,
    #[serde(default)]
    pub drawdown: Decimal,
    #[serde(default)]
    pub total_trades: u64,
    /// Percentage in 0..=100.
    #[serde(default)]
    pub win_rate: Decimal,
    pub last_seen: DateTime<Utc>,
}

impl Agent {
    pub fn key(&self) -> AgentKey {
        AgentKey::new(self.magic_number, self.instance_uuid.clone())
    }
}

/// Account-level figures reported by the backend (not derivable from agents).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSummary {
    #[serde(default)]
    pub balance: Decimal,
    #[serde(default)]
    pub equity: Decimal,
    #[serde(default)]
    pub free_margin: Option<Decimal>,
    pub updated_at: DateTime<Utc>,
}

/// Latest quote for a symbol from the price stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub timestamp: DateTime<Utc>,
}
