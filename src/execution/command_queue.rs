use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::gauge;
use sqlx::PgPool;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use uuid::Uuid;

use super::delivery::{deliver_into, settle, CommandSink};
use crate::backend::CommandAck;
use crate::db::command_repo;
use crate::errors::QueueError;
use crate::models::{Command, CommandStatus, RemoteAck, TargetResult};

/// Terminal commands kept for audit before the oldest are evicted.
const MAX_AUDIT_ENTRIES: usize = 1_000;

/// Result of asking the queue for work.
#[derive(Debug)]
pub enum Claim {
    Ready(Command),
    /// Nothing ready; the earliest scheduled command becomes due at this time.
    WaitUntil(DateTime<Utc>),
    Idle,
}

#[derive(Default)]
struct QueueInner {
    commands: HashMap<Uuid, Command>,
    /// Every known command in creation order.
    order: VecDeque<Uuid>,
    /// Pending commands in creation order.
    pending: VecDeque<Uuid>,
}

impl QueueInner {
    fn evict_old(&mut self) {
        while self.order.len() > MAX_AUDIT_ENTRIES {
            let Some(pos) = self
                .order
                .iter()
                .position(|id| self.commands.get(id).is_some_and(|c| c.status.is_terminal()))
            else {
                break;
            };
            if let Some(id) = self.order.remove(pos) {
                self.commands.remove(&id);
            }
        }
    }
}

/// Ordered commands with their lifecycle. Every status transition happens
/// under one lock, so cancel and worker pickup cannot both win.
pub struct CommandQueue {
    inner: Mutex<QueueInner>,
    wakeup: Notify,
    updates: broadcast::Sender<Command>,
    journal: Option<PgPool>,
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandQueue {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(256);
        Self {
            inner: Mutex::new(QueueInner::default()),
            wakeup: Notify::new(),
            updates,
            journal: None,
        }
    }

    /// Queue that persists every transition to the `commands` table.
    pub fn with_journal(pool: PgPool) -> Self {
        Self {
            journal: Some(pool),
            ..Self::new()
        }
    }

    /// Admit a pending command at the back of the queue.
    pub async fn push(&self, mut command: Command) -> Command {
        command.status = CommandStatus::Pending;
        {
            let mut inner = self.inner.lock().await;
            inner.order.push_back(command.id);
            inner.pending.push_back(command.id);
            inner.commands.insert(command.id, command.clone());
            inner.evict_old();
            gauge!("command_queue_pending").set(inner.pending.len() as f64);
        }
        self.wakeup.notify_one();

        tracing::info!(
            command_id = %command.id,
            command = command.kind.name(),
            targets = command.targets.len(),
            scheduled_for = ?command.scheduled_for,
            "Command queued"
        );
        self.published(&command).await;
        command
    }

    /// Re-admit pending commands loaded from the journal at startup.
    pub async fn restore(&self, commands: Vec<Command>) {
        let mut inner = self.inner.lock().await;
        for command in commands {
            if command.status != CommandStatus::Pending || inner.commands.contains_key(&command.id) {
                continue;
            }
            inner.order.push_back(command.id);
            inner.pending.push_back(command.id);
            inner.commands.insert(command.id, command);
        }
        gauge!("command_queue_pending").set(inner.pending.len() as f64);
        drop(inner);
        self.wakeup.notify_one();
    }

    /// Store a command that bypassed the queue (immediate execution) so it
    /// shows in the same audit trail.
    pub async fn record(&self, command: Command) {
        {
            let mut inner = self.inner.lock().await;
            if !inner.commands.contains_key(&command.id) {
                inner.order.push_back(command.id);
            }
            inner.commands.insert(command.id, command.clone());
            inner.evict_old();
        }
        self.published(&command).await;
    }

    /// Cancel a command that has not been picked up yet.
    pub async fn cancel(&self, id: Uuid) -> Result<Command, QueueError> {
        let command = {
            let mut inner = self.inner.lock().await;
            let command = inner.commands.get_mut(&id).ok_or(QueueError::NotFound(id))?;
            if command.status != CommandStatus::Pending {
                return Err(QueueError::NotCancellable {
                    id,
                    status: command.status,
                });
            }
            command.status = CommandStatus::Cancelled;
            command.completed_at = Some(Utc::now());
            let command = command.clone();
            inner.pending.retain(|p| *p != id);
            gauge!("command_queue_pending").set(inner.pending.len() as f64);
            command
        };

        tracing::info!(command_id = %id, "Command cancelled before dispatch");
        self.published(&command).await;
        Ok(command)
    }

    /// Take the oldest pending command that is due and mark it executing.
    pub async fn claim_next(&self, now: DateTime<Utc>) -> Claim {
        let claimed = {
            let mut inner = self.inner.lock().await;

            let due = inner.pending.iter().position(|id| {
                inner
                    .commands
                    .get(id)
                    .is_some_and(|c| c.scheduled_for.map_or(true, |at| at <= now))
            });

            match due {
                Some(pos) => {
                    let id = inner.pending.remove(pos);
                    let claimed = id.and_then(|id| inner.commands.get_mut(&id)).map(|command| {
                        command.status = CommandStatus::Executing;
                        command.executed_at = Some(now);
                        command.clone()
                    });
                    gauge!("command_queue_pending").set(inner.pending.len() as f64);
                    claimed
                }
                None => {
                    let next_due = inner
                        .pending
                        .iter()
                        .filter_map(|id| inner.commands.get(id).and_then(|c| c.scheduled_for))
                        .min();
                    return match next_due {
                        Some(at) => Claim::WaitUntil(at),
                        None => Claim::Idle,
                    };
                }
            }
        };

        match claimed {
            Some(command) => {
                self.published(&command).await;
                Claim::Ready(command)
            }
            None => Claim::Idle,
        }
    }

    /// Record delivery results for an executing command.
    pub async fn complete(&self, id: Uuid, results: Vec<TargetResult>) -> Option<Command> {
        let command = {
            let mut inner = self.inner.lock().await;
            let command = inner.commands.get_mut(&id)?;
            command.finish(results);
            command.clone()
        };

        tracing::info!(
            command_id = %id,
            status = %command.status,
            delivered = command.succeeded().len(),
            failed = command.failed().len(),
            "Command finished"
        );
        self.published(&command).await;
        Some(command)
    }

    /// Attach an agent's acknowledgement to the matching target result.
    /// Never changes the command status or any agent state.
    pub async fn record_ack(&self, ack: &CommandAck) -> bool {
        let command = {
            let mut inner = self.inner.lock().await;
            let Some(command) = inner.commands.get_mut(&ack.command_id) else {
                return false;
            };
            let Some(result) = command.results.iter_mut().find(|r| {
                r.target.magic_number == ack.magic_number
                    && r.target.instance_uuid == ack.instance_uuid
            }) else {
                return false;
            };
            result.remote_ack = Some(RemoteAck {
                status: ack.status.clone(),
                message: ack.message.clone(),
                received_at: Utc::now(),
            });
            command.clone()
        };

        self.published(&command).await;
        true
    }

    pub async fn get(&self, id: Uuid) -> Option<Command> {
        self.inner.lock().await.commands.get(&id).cloned()
    }

    /// All known commands, oldest first.
    pub async fn list(&self) -> Vec<Command> {
        let inner = self.inner.lock().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.commands.get(id).cloned())
            .collect()
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Command> {
        self.updates.subscribe()
    }

    async fn published(&self, command: &Command) {
        let _ = self.updates.send(command.clone());

        if let Some(pool) = &self.journal {
            if let Err(e) = command_repo::upsert_command(pool, command).await {
                tracing::error!(
                    command_id = %command.id,
                    error = %e,
                    "Failed to journal command"
                );
            }
        }
    }
}

/// Background worker: picks due commands in creation order and delivers
/// them target by target. No automatic retry; a failed command stays failed.
pub async fn run_queue_worker(
    queue: Arc<CommandQueue>,
    sink: Arc<dyn CommandSink>,
    delivery_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!("Command queue worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        match queue.claim_next(Utc::now()).await {
            Claim::Ready(command) => {
                tracing::info!(
                    command_id = %command.id,
                    command = command.kind.name(),
                    targets = command.targets.len(),
                    "Dispatching queued command"
                );
                let mut slots: Vec<Option<TargetResult>> = vec![None; command.targets.len()];
                let stopped = {
                    let delivery =
                        deliver_into(sink.as_ref(), &command, delivery_timeout, &mut slots);
                    tokio::pin!(delivery);
                    tokio::select! {
                        _ = &mut delivery => false,
                        _ = shutdown.changed() => true,
                    }
                };
                if stopped {
                    tracing::warn!(
                        command_id = %command.id,
                        finished = slots.iter().filter(|s| s.is_some()).count(),
                        targets = command.targets.len(),
                        "Shutdown interrupted command delivery"
                    );
                }
                queue.complete(command.id, settle(&command, slots)).await;
                if stopped {
                    break;
                }
            }
            Claim::WaitUntil(at) => {
                let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = queue.wakeup.notified() => {}
                    _ = shutdown.changed() => break,
                }
            }
            Claim::Idle => {
                tokio::select! {
                    _ = queue.wakeup.notified() => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }

    tracing::info!("Command queue worker stopped");
}
