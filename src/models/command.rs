use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::agent::{Agent, AgentKey};
use crate::errors::ValidationError;

/// Upper bound accepted for `adjust_risk.risk_percent`.
const MAX_RISK_PERCENT: i64 = 100;

// ---------------------------------------------------------------------------
// Command kinds and their parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseFilter {
    #[default]
    All,
    Profitable,
    Losing,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClosePositionsParams {
    #[serde(default)]
    pub filter: CloseFilter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdjustRiskParams {
    pub risk_percent: Decimal,
    #[serde(default)]
    pub max_positions: Option<u32>,
}

/// What the operator wants the agents to do, with a typed payload per kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "parameters", rename_all = "snake_case")]
pub enum CommandKind {
    Pause,
    Resume,
    ClosePositions(ClosePositionsParams),
    AdjustRisk(AdjustRiskParams),
}

impl CommandKind {
    /// Build a command from its wire name and optional JSON parameters.
    /// `pause` and `resume` take no payload; an empty object or `null` is
    /// tolerated as "no payload".
    pub fn parse(command: &str, parameters: Option<&Value>) -> Result<Self, ValidationError> {
        let has_payload = parameters.is_some_and(|p| match p {
            Value::Null => false,
            Value::Object(map) => !map.is_empty(),
            _ => true,
        });

        let kind = match command {
            "pause" | "resume" => {
                if has_payload {
                    return Err(ValidationError::UnexpectedPayload {
                        command: command.to_string(),
                    });
                }
                if command == "pause" {
                    CommandKind::Pause
                } else {
                    CommandKind::Resume
                }
            }
            "close_positions" => CommandKind::ClosePositions(parse_params(command, parameters)?),
            "adjust_risk" => CommandKind::AdjustRisk(parse_params(command, parameters)?),
            other => return Err(ValidationError::UnknownCommand(other.to_string())),
        };

        kind.validate()?;
        Ok(kind)
    }

    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::Pause => "pause",
            CommandKind::Resume => "resume",
            CommandKind::ClosePositions(_) => "close_positions",
            CommandKind::AdjustRisk(_) => "adjust_risk",
        }
    }

    /// Commands whose effect depends on market conditions; callers should
    /// check the blackout decision before sending these.
    pub fn is_trading_affecting(&self) -> bool {
        matches!(self, CommandKind::ClosePositions(_) | CommandKind::AdjustRisk(_))
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if let CommandKind::AdjustRisk(params) = self {
            if params.risk_percent <= Decimal::ZERO
                || params.risk_percent > Decimal::from(MAX_RISK_PERCENT)
            {
                return Err(ValidationError::InvalidParameter {
                    field: "risk_percent",
                    reason: format!("must be in (0, {MAX_RISK_PERCENT}], got {}", params.risk_percent),
                });
            }
            if params.max_positions == Some(0) {
                return Err(ValidationError::InvalidParameter {
                    field: "max_positions",
                    reason: "must be at least 1".into(),
                });
            }
        }
        Ok(())
    }

    /// The `parameters` object sent to an agent.
    pub fn parameters(&self) -> Value {
        let value = match self {
            CommandKind::Pause | CommandKind::Resume => return Value::Object(Map::new()),
            CommandKind::ClosePositions(p) => serde_json::to_value(p),
            CommandKind::AdjustRisk(p) => serde_json::to_value(p),
        };
        value.unwrap_or_default()
    }
}

fn parse_params<T: DeserializeOwned>(
    command: &str,
    parameters: Option<&Value>,
) -> Result<T, ValidationError> {
    let value = parameters
        .filter(|p| !p.is_null())
        .cloned()
        .unwrap_or_else(|| Value::Object(Map::new()));
    serde_json::from_value(value).map_err(|e| ValidationError::MalformedParameters {
        command: command.to_string(),
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Target selector
// ---------------------------------------------------------------------------

/// Which agents a command is aimed at. Textual forms:
/// `all`, `symbol_<SYMBOL>`, `strategy_<TAG>`, `ea_<magic>_<uuid>[,ea_<magic>_<uuid>...]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TargetSelector {
    All,
    Symbol(String),
    Strategy(String),
    Agents(Vec<AgentKey>),
}

impl TargetSelector {
    pub fn matches(&self, agent: &Agent) -> bool {
        match self {
            TargetSelector::All => true,
            TargetSelector::Symbol(symbol) => agent.symbol.eq_ignore_ascii_case(symbol),
            TargetSelector::Strategy(tag) => agent.strategy_tag == *tag,
            TargetSelector::Agents(keys) => keys.iter().any(|k| {
                k.magic_number == agent.magic_number && k.instance_uuid == agent.instance_uuid
            }),
        }
    }
}

fn parse_agent_key(raw: &str) -> Option<AgentKey> {
    let rest = raw.trim().strip_prefix("ea_")?;
    let (magic, uuid) = rest.split_once('_')?;
    let magic_number = magic.parse().ok()?;
    if uuid.is_empty() {
        return None;
    }
    Some(AgentKey::new(magic_number, uuid))
}

impl FromStr for TargetSelector {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || ValidationError::InvalidSelector(s.to_string());

        if s.eq_ignore_ascii_case("all") {
            return Ok(TargetSelector::All);
        }
        if let Some(symbol) = s.strip_prefix("symbol_") {
            if symbol.is_empty() {
                return Err(invalid());
            }
            return Ok(TargetSelector::Symbol(symbol.to_ascii_uppercase()));
        }
        if let Some(tag) = s.strip_prefix("strategy_") {
            if tag.is_empty() {
                return Err(invalid());
            }
            return Ok(TargetSelector::Strategy(tag.to_string()));
        }
        if s.starts_with("ea_") {
            let keys = s
                .split(',')
                .map(parse_agent_key)
                .collect::<Option<Vec<_>>>()
                .ok_or_else(invalid)?;
            return Ok(TargetSelector::Agents(keys));
        }

        Err(invalid())
    }
}

impl TryFrom<String> for TargetSelector {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TargetSelector> for String {
    fn from(value: TargetSelector) -> Self {
        value.to_string()
    }
}

impl fmt::Display for TargetSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetSelector::All => write!(f, "all"),
            TargetSelector::Symbol(symbol) => write!(f, "symbol_{symbol}"),
            TargetSelector::Strategy(tag) => write!(f, "strategy_{tag}"),
            TargetSelector::Agents(keys) => {
                let joined: Vec<String> = keys.iter().map(ToString::to_string).collect();
                write!(f, "{}", joined.join(","))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Command entity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Executing,
    Success,
    Failed,
    PartialSuccess,
    Cancelled,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Executing => "executing",
            CommandStatus::Success => "success",
            CommandStatus::Failed => "failed",
            CommandStatus::PartialSuccess => "partial_success",
            CommandStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, CommandStatus::Pending | CommandStatus::Executing)
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved target, frozen at admission time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTarget {
    pub magic_number: i64,
    pub instance_uuid: String,
    pub symbol: String,
}

impl CommandTarget {
    pub fn key(&self) -> AgentKey {
        AgentKey::new(self.magic_number, self.instance_uuid.clone())
    }
}

impl From<&Agent> for CommandTarget {
    fn from(agent: &Agent) -> Self {
        Self {
            magic_number: agent.magic_number,
            instance_uuid: agent.instance_uuid.clone(),
            symbol: agent.symbol.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered,
    Failed { reason: String, retryable: bool },
}

/// Acknowledgement an agent pushed back after executing a delivered command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAck {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetResult {
    pub target: CommandTarget,
    pub outcome: DeliveryOutcome,
    pub attempted_at: DateTime<Utc>,
    #[serde(default)]
    pub remote_ack: Option<RemoteAck>,
}

impl TargetResult {
    pub fn is_delivered(&self) -> bool {
        matches!(self.outcome, DeliveryOutcome::Delivered)
    }
}

/// Three-way aggregate over per-target results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    AllSucceeded,
    AllFailed,
    Partial,
}

impl DispatchOutcome {
    pub fn from_results(results: &[TargetResult]) -> Option<Self> {
        if results.is_empty() {
            return None;
        }
        let delivered = results.iter().filter(|r| r.is_delivered()).count();
        Some(if delivered == results.len() {
            DispatchOutcome::AllSucceeded
        } else if delivered == 0 {
            DispatchOutcome::AllFailed
        } else {
            DispatchOutcome::Partial
        })
    }

    pub fn status(&self) -> CommandStatus {
        match self {
            DispatchOutcome::AllSucceeded => CommandStatus::Success,
            DispatchOutcome::AllFailed => CommandStatus::Failed,
            DispatchOutcome::Partial => CommandStatus::PartialSuccess,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: Uuid,
    pub kind: CommandKind,
    pub selector: TargetSelector,
    pub targets: Vec<CommandTarget>,
    pub status: CommandStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub executed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub results: Vec<TargetResult>,
}

impl Command {
    pub fn new(
        kind: CommandKind,
        selector: TargetSelector,
        targets: Vec<CommandTarget>,
        scheduled_for: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            selector,
            targets,
            status: CommandStatus::Pending,
            created_at: Utc::now(),
            scheduled_for,
            executed_at: None,
            completed_at: None,
            results: Vec::new(),
        }
    }

    /// Record delivery results and move to the matching terminal status.
    pub fn finish(&mut self, results: Vec<TargetResult>) {
        self.status = DispatchOutcome::from_results(&results)
            .map(|o| o.status())
            .unwrap_or(CommandStatus::Failed);
        self.results = results;
        self.completed_at = Some(Utc::now());
    }

    pub fn outcome(&self) -> Option<DispatchOutcome> {
        DispatchOutcome::from_results(&self.results)
    }

    pub fn succeeded(&self) -> Vec<&CommandTarget> {
        self.results
            .iter()
            .filter(|r| r.is_delivered())
            .map(|r| &r.target)
            .collect()
    }

    pub fn failed(&self) -> Vec<(&CommandTarget, &str)> {
        self.results
            .iter()
            .filter_map(|r| match &r.outcome {
                DeliveryOutcome::Failed { reason, .. } => Some((&r.target, reason.as_str())),
                DeliveryOutcome::Delivered => None,
            })
            .collect()
    }
}

/// Operator intent as it arrives from the API.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    #[serde(default)]
    pub parameters: Option<Value>,
    pub target: String,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
}
