use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{Agent, ImpactMargins, NewsEvent, PriceTick};

// ---------------------------------------------------------------------------
// Push channel: inbound
// ---------------------------------------------------------------------------

/// Messages received on the push channel, `{ "type": ..., "data": {...} }`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum InboundMessage {
    EaUpdate(EaUpdate),
    PortfolioUpdate(PortfolioUpdate),
    NewsUpdate(NewsUpdate),
    CommandUpdate(CommandAck),
    PriceUpdate(PriceTick),
    AuthResponse(AuthResponse),
    PriceSubscriptionResponse(Value),
}

impl InboundMessage {
    /// Subscription channel this message belongs to, if any.
    pub fn channel(&self) -> Option<&'static str> {
        match self {
            InboundMessage::EaUpdate(_) => Some("ea_updates"),
            InboundMessage::PortfolioUpdate(_) => Some("portfolio"),
            InboundMessage::NewsUpdate(_) => Some("news"),
            InboundMessage::CommandUpdate(_) => Some("commands"),
            InboundMessage::PriceUpdate(_) => Some("prices"),
            InboundMessage::AuthResponse(_) | InboundMessage::PriceSubscriptionResponse(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::EaUpdate(_) => "ea_update",
            InboundMessage::PortfolioUpdate(_) => "portfolio_update",
            InboundMessage::NewsUpdate(_) => "news_update",
            InboundMessage::CommandUpdate(_) => "command_update",
            InboundMessage::PriceUpdate(_) => "price_update",
            InboundMessage::AuthResponse(_) => "auth_response",
            InboundMessage::PriceSubscriptionResponse(_) => "price_subscription_response",
        }
    }
}

/// `ea_update` carries either one agent or a batch.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EaUpdate {
    Batch { eas: Vec<Agent> },
    Single(Agent),
}

impl EaUpdate {
    pub fn into_agents(self) -> Vec<Agent> {
        match self {
            EaUpdate::Batch { eas } => eas,
            EaUpdate::Single(agent) => vec![agent],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortfolioUpdate {
    #[serde(default)]
    pub eas: Vec<Agent>,
    #[serde(default)]
    pub balance: Option<Decimal>,
    #[serde(default)]
    pub equity: Option<Decimal>,
    #[serde(default)]
    pub free_margin: Option<Decimal>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum NewsUpdate {
    Batch { events: Vec<NewsEvent> },
    List(Vec<NewsEvent>),
    Single(NewsEvent),
}

impl NewsUpdate {
    pub fn into_events(self) -> Vec<NewsEvent> {
        match self {
            NewsUpdate::Batch { events } | NewsUpdate::List(events) => events,
            NewsUpdate::Single(event) => vec![event],
        }
    }
}

/// An agent's report on a command it received.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandAck {
    pub command_id: Uuid,
    pub magic_number: i64,
    pub instance_uuid: String,
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

// ---------------------------------------------------------------------------
// Push channel: outbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OutboundMessage {
    Auth { token: String },
    Subscribe { channels: Vec<String> },
    SubscribePrices { symbols: Vec<String> },
}

// ---------------------------------------------------------------------------
// HTTP collaborator payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AgentList {
    Wrapped { eas: Vec<Agent> },
    Bare(Vec<Agent>),
}

impl AgentList {
    pub fn into_agents(self) -> Vec<Agent> {
        match self {
            AgentList::Wrapped { eas } | AgentList::Bare(eas) => eas,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum NewsList {
    Wrapped { events: Vec<NewsEvent> },
    Bare(Vec<NewsEvent>),
}

impl NewsList {
    pub fn into_events(self) -> Vec<NewsEvent> {
        match self {
            NewsList::Wrapped { events } | NewsList::Bare(events) => events,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ImpactConfigList {
    Wrapped { config: Vec<ImpactMargins> },
    Bare(Vec<ImpactMargins>),
}

impl ImpactConfigList {
    pub fn into_margins(self) -> Vec<ImpactMargins> {
        match self {
            ImpactConfigList::Wrapped { config } | ImpactConfigList::Bare(config) => config,
        }
    }
}

/// Account figures from the global-stats endpoint. Agent aggregates in the
/// same response are ignored; those are derived locally.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountStats {
    #[serde(default)]
    pub balance: Decimal,
    #[serde(default)]
    pub equity: Decimal,
    #[serde(default)]
    pub free_margin: Option<Decimal>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SingleCommandBody<'a> {
    pub command: &'a str,
    pub parameters: Value,
    pub instance_uuid: &'a str,
    pub command_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandResponse {
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize)]
pub struct OverrideEnableBody<'a> {
    pub symbol: &'a str,
    pub duration_minutes: u32,
    pub reason: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct OverrideDisableBody<'a> {
    pub symbol: &'a str,
}
