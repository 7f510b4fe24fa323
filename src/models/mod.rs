pub mod agent;
pub mod command;
pub mod connection;
pub mod news;
pub mod stats;

pub use agent::{AccountSummary, Agent, AgentKey, AgentStatus, PriceTick};
pub use command::{
    AdjustRiskParams, CloseFilter, ClosePositionsParams, Command, CommandKind, CommandRequest,
    CommandStatus, CommandTarget, DeliveryOutcome, DispatchOutcome, RemoteAck, TargetResult,
    TargetSelector,
};
pub use connection::{ConnectionPhase, ConnectionState};
pub use news::{ImpactLevel, ImpactMargins, ManualOverride, NewsEvent};
pub use stats::GlobalStats;
