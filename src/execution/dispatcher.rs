use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use serde::Serialize;

use super::command_queue::CommandQueue;
use super::delivery::{deliver_to_targets, settle, CommandSink};
use crate::blackout::BlackoutDecision;
use crate::errors::{QueueError, ValidationError};
use crate::models::{
    Agent, Command, CommandKind, CommandRequest, CommandStatus, CommandTarget, DispatchOutcome,
    TargetSelector,
};
use crate::state::StateStore;

/// Agents matching `selector`, ordered by `(magic_number, instance_uuid)`.
/// Explicit keys that no longer match a known agent are dropped.
pub fn resolve_targets(selector: &TargetSelector, agents: &[Agent]) -> Vec<Agent> {
    let mut targets: Vec<Agent> = agents
        .iter()
        .filter(|a| selector.matches(a))
        .cloned()
        .collect();
    targets.sort_by(|a, b| {
        (a.magic_number, &a.instance_uuid).cmp(&(b.magic_number, &b.instance_uuid))
    });
    targets.dedup_by(|a, b| a.magic_number == b.magic_number && a.instance_uuid == b.instance_uuid);
    targets
}

#[derive(Debug, Clone, Serialize)]
pub struct SymbolDecision {
    pub symbol: String,
    pub trading_allowed: bool,
    pub reason: String,
    pub decision: BlackoutDecision,
}

impl SymbolDecision {
    pub fn new(symbol: String, decision: BlackoutDecision) -> Self {
        Self {
            symbol,
            trading_allowed: decision.trading_allowed(),
            reason: decision.reason(),
            decision,
        }
    }
}

/// What a command would hit, without admitting it.
#[derive(Debug, Clone, Serialize)]
pub struct CommandPreview {
    pub command: CommandKind,
    pub targets: Vec<CommandTarget>,
    pub blackout: Vec<SymbolDecision>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub outcome: DispatchOutcome,
    pub command: Command,
    /// Blackout state of the affected symbols at send time. Informational:
    /// enforcement is the caller's decision.
    pub blackout: Vec<SymbolDecision>,
}

/// Turns operator intent into validated, targeted commands and delivers
/// them now or through the queue.
pub struct CommandDispatcher {
    store: Arc<StateStore>,
    queue: Arc<CommandQueue>,
    sink: Arc<dyn CommandSink>,
    delivery_timeout: Duration,
}

impl CommandDispatcher {
    pub fn new(
        store: Arc<StateStore>,
        queue: Arc<CommandQueue>,
        sink: Arc<dyn CommandSink>,
        delivery_timeout: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            sink,
            delivery_timeout,
        }
    }

    /// Parse, validate and resolve a request into a pending command.
    /// Every rejection happens here, before anything touches the network.
    pub async fn prepare(&self, request: &CommandRequest) -> Result<Command, ValidationError> {
        let result = self.build(request).await;
        if let Err(e) = &result {
            counter!("commands_rejected_total").increment(1);
            tracing::warn!(
                command = %request.command,
                target = %request.target,
                error = %e,
                "Command rejected at admission"
            );
        }
        result
    }

    async fn build(&self, request: &CommandRequest) -> Result<Command, ValidationError> {
        let kind = CommandKind::parse(&request.command, request.parameters.as_ref())?;
        let selector: TargetSelector = request.target.parse()?;

        let agents = self.store.agents().await;
        let targets: Vec<CommandTarget> = resolve_targets(&selector, &agents)
            .iter()
            .map(CommandTarget::from)
            .collect();
        if targets.is_empty() {
            return Err(ValidationError::EmptyTargets {
                selector: selector.to_string(),
            });
        }

        Ok(Command::new(kind, selector, targets, request.scheduled_for))
    }

    /// Blackout decision for every distinct symbol among `targets`.
    pub async fn blackout_for(&self, targets: &[CommandTarget]) -> Vec<SymbolDecision> {
        let symbols: Vec<String> = targets
            .iter()
            .map(|t| t.symbol.to_ascii_uppercase())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        self.store
            .blackout(&symbols, Utc::now())
            .await
            .into_iter()
            .map(|(symbol, decision)| SymbolDecision::new(symbol, decision))
            .collect()
    }

    pub async fn preview(&self, request: &CommandRequest) -> Result<CommandPreview, ValidationError> {
        let command = self.prepare(request).await?;
        let blackout = self.blackout_for(&command.targets).await;
        Ok(CommandPreview {
            command: command.kind,
            targets: command.targets,
            blackout,
        })
    }

    /// Deliver to every target right away. Per-target failures are isolated
    /// and reported; they never abort the remaining targets.
    pub async fn execute_now(&self, request: &CommandRequest) -> Result<ExecutionReport, ValidationError> {
        let mut command = self.prepare(request).await?;

        let blackout = if command.kind.is_trading_affecting() {
            let decisions = self.blackout_for(&command.targets).await;
            for d in decisions.iter().filter(|d| !d.trading_allowed) {
                tracing::warn!(
                    command_id = %command.id,
                    symbol = %d.symbol,
                    reason = %d.reason,
                    "Sending trading command during blackout"
                );
            }
            decisions
        } else {
            Vec::new()
        };

        command.status = CommandStatus::Executing;
        command.executed_at = Some(Utc::now());
        self.queue.record(command.clone()).await;

        // Delivery and the final record run detached: a dropped request must
        // not leave the audit entry in `executing`.
        let sink = self.sink.clone();
        let queue = self.queue.clone();
        let timeout = self.delivery_timeout;
        let mut in_flight = command.clone();
        let delivery = tokio::spawn(async move {
            let results = deliver_to_targets(sink.as_ref(), &in_flight, timeout).await;
            in_flight.finish(results);
            queue.record(in_flight.clone()).await;
            in_flight
        });

        let command = match delivery.await {
            Ok(finished) => finished,
            Err(e) => {
                tracing::error!(command_id = %command.id, error = %e, "Delivery task failed");
                let unfinished = vec![None; command.targets.len()];
                let results = settle(&command, unfinished);
                command.finish(results);
                self.queue.record(command.clone()).await;
                command
            }
        };

        let outcome = command.outcome().unwrap_or(DispatchOutcome::AllFailed);
        match outcome {
            DispatchOutcome::AllSucceeded => tracing::info!(
                command_id = %command.id,
                command = command.kind.name(),
                targets = command.targets.len(),
                "Command delivered to all targets"
            ),
            DispatchOutcome::Partial => tracing::warn!(
                command_id = %command.id,
                command = command.kind.name(),
                delivered = command.succeeded().len(),
                failed = command.failed().len(),
                "Command partially delivered"
            ),
            DispatchOutcome::AllFailed => tracing::error!(
                command_id = %command.id,
                command = command.kind.name(),
                targets = command.targets.len(),
                "Command delivery failed for every target"
            ),
        }

        Ok(ExecutionReport {
            outcome,
            command,
            blackout,
        })
    }

    /// Admit a command into the queue in `pending` state.
    pub async fn enqueue(&self, request: &CommandRequest) -> Result<Command, ValidationError> {
        let command = self.prepare(request).await?;
        counter!("commands_enqueued_total").increment(1);
        Ok(self.queue.push(command).await)
    }

    pub async fn cancel(&self, id: uuid::Uuid) -> Result<Command, QueueError> {
        self.queue.cancel(id).await
    }
}
