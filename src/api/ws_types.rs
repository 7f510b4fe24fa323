use serde::Serialize;

use crate::models::{Command, ConnectionState, GlobalStats};

/// Messages broadcast to all connected dashboard WebSocket clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum WsMessage {
    #[serde(rename = "state_update")]
    StateUpdate(StateSummary),

    #[serde(rename = "command_update")]
    CommandUpdate(Command),
}

#[derive(Debug, Clone, Serialize)]
pub struct StateSummary {
    pub version: u64,
    pub stats: GlobalStats,
    pub connection: ConnectionState,
}
