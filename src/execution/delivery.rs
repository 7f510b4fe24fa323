use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{FuturesUnordered, StreamExt};
use metrics::counter;

use crate::errors::DeliveryError;
use crate::models::{AgentKey, Command, CommandTarget, DeliveryOutcome, TargetResult};

/// Transport that carries one command to one agent.
#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn deliver(&self, agent: &AgentKey, command: &Command) -> Result<(), DeliveryError>;
}

/// Deliver `command` to every target concurrently. Each target is bounded by
/// `timeout` and fails independently; results keep target order.
pub async fn deliver_to_targets(
    sink: &dyn CommandSink,
    command: &Command,
    timeout: Duration,
) -> Vec<TargetResult> {
    let mut slots: Vec<Option<TargetResult>> = vec![None; command.targets.len()];
    deliver_into(sink, command, timeout, &mut slots).await;
    settle(command, slots)
}

/// Like [`deliver_to_targets`], but each result lands in `slots` (indexed
/// like `command.targets`) the moment its target finishes. Dropping the
/// future early leaves unfinished targets as `None`.
pub async fn deliver_into(
    sink: &dyn CommandSink,
    command: &Command,
    timeout: Duration,
    slots: &mut [Option<TargetResult>],
) {
    let mut attempts: FuturesUnordered<_> = command
        .targets
        .iter()
        .enumerate()
        .map(move |(i, target)| async move { (i, deliver_one(sink, command, target, timeout).await) })
        .collect();

    while let Some((i, result)) = attempts.next().await {
        slots[i] = Some(result);
    }
}

/// Final per-target results. A target that never finished is reported as
/// interrupted; finished targets keep their real outcome.
pub fn settle(command: &Command, slots: Vec<Option<TargetResult>>) -> Vec<TargetResult> {
    let now = Utc::now();
    command
        .targets
        .iter()
        .zip(slots)
        .map(|(target, slot)| {
            slot.unwrap_or_else(|| TargetResult {
                target: target.clone(),
                outcome: failed(&DeliveryError::Interrupted),
                attempted_at: now,
                remote_ack: None,
            })
        })
        .collect()
}

async fn deliver_one(
    sink: &dyn CommandSink,
    command: &Command,
    target: &CommandTarget,
    timeout: Duration,
) -> TargetResult {
    let attempted_at = Utc::now();
    let key = target.key();

    let result = match tokio::time::timeout(timeout, sink.deliver(&key, command)).await {
        Ok(result) => result,
        Err(_) => Err(DeliveryError::Timeout(timeout)),
    };

    let outcome = match result {
        Ok(()) => {
            counter!("command_deliveries_total", "result" => "delivered").increment(1);
            tracing::debug!(command_id = %command.id, agent = %key, "Command delivered");
            DeliveryOutcome::Delivered
        }
        Err(e) => {
            counter!("command_deliveries_total", "result" => "failed").increment(1);
            tracing::warn!(
                command_id = %command.id,
                command = command.kind.name(),
                agent = %key,
                error = %e,
                "Command delivery failed"
            );
            failed(&e)
        }
    };

    TargetResult {
        target: target.clone(),
        outcome,
        attempted_at,
        remote_ack: None,
    }
}

pub fn failed(error: &DeliveryError) -> DeliveryOutcome {
    DeliveryOutcome::Failed {
        reason: error.to_string(),
        retryable: error.is_retryable(),
    }
}
