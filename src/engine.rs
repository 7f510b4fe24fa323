use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusHandle;
use sqlx::PgPool;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::api::ws_types::WsMessage;
use crate::backend::{BackendClient, InboundMessage};
use crate::config::AppConfig;
use crate::db::command_repo;
use crate::execution::{run_queue_worker, CommandDispatcher, CommandQueue, CommandSink};
use crate::ingestion::{run_pipeline, ConnectionConfig, ConnectionManager};
use crate::services::dashboard_feed::run_dashboard_feed;
use crate::services::staleness_sweeper::run_staleness_sweeper;
use crate::services::state_poller::run_state_poller;
use crate::services::{BlackoutControl, OperatorActions, SnapshotSource};
use crate::state::StateStore;
use crate::AppState;

const INBOUND_BUFFER: usize = 1024;
const DASHBOARD_BUFFER: usize = 256;

/// Owns every long-running component. Constructed once at startup and torn
/// down explicitly; nothing here is a global.
pub struct Engine {
    state: AppState,
    connection: Arc<ConnectionManager>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Engine {
    /// Wire components together and spawn their background tasks. Never
    /// fails because a collaborator is unreachable; the connection manager
    /// and poller keep retrying in the background.
    pub async fn start(
        config: AppConfig,
        metrics_handle: PrometheusHandle,
        journal: Option<PgPool>,
    ) -> anyhow::Result<Self> {
        let backend = Arc::new(BackendClient::new(
            config.backend_http_url.clone(),
            config.backend_auth_token.clone(),
        ));

        let queue = match journal {
            Some(pool) => Arc::new(restore_queue(pool).await?),
            None => Arc::new(CommandQueue::new()),
        };

        let store = Arc::new(StateStore::new());
        let sink: Arc<dyn CommandSink> = backend.clone();
        let source: Arc<dyn SnapshotSource> = backend.clone();
        let control: Arc<dyn BlackoutControl> = backend;

        let dispatcher = Arc::new(CommandDispatcher::new(
            store.clone(),
            queue.clone(),
            sink.clone(),
            config.delivery_timeout,
        ));
        let operator = Arc::new(OperatorActions::new(store.clone(), Some(control)));

        let (inbound_tx, inbound_rx) = mpsc::channel::<InboundMessage>(INBOUND_BUFFER);
        let connection = Arc::new(ConnectionManager::new(
            ConnectionConfig::from_app(&config),
            inbound_tx,
        ));
        for channel in &config.push_channels {
            connection.subscribe(channel);
        }
        connection.subscribe_prices(&config.price_symbols);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ws_tx, _) = broadcast::channel::<WsMessage>(DASHBOARD_BUFFER);
        let mut tasks = Vec::new();

        tasks.push((
            "connection",
            tokio::spawn(connection.clone().run(shutdown_rx.clone())),
        ));
        tasks.push((
            "pipeline",
            tokio::spawn(run_pipeline(
                inbound_rx,
                store.clone(),
                queue.clone(),
                shutdown_rx.clone(),
            )),
        ));
        tasks.push((
            "poller",
            tokio::spawn(run_state_poller(
                source,
                store.clone(),
                connection.watch_state(),
                config.poll_fast,
                config.poll_slow,
                shutdown_rx.clone(),
            )),
        ));
        tasks.push((
            "sweeper",
            tokio::spawn(run_staleness_sweeper(
                store.clone(),
                config.poll_slow,
                config.agent_stale_after,
                shutdown_rx.clone(),
            )),
        ));
        tasks.push((
            "queue_worker",
            tokio::spawn(run_queue_worker(
                queue.clone(),
                sink,
                config.delivery_timeout,
                shutdown_rx.clone(),
            )),
        ));
        tasks.push((
            "dashboard_feed",
            tokio::spawn(run_dashboard_feed(
                store.clone(),
                connection.watch_state(),
                queue.subscribe(),
                ws_tx.clone(),
                shutdown_rx,
            )),
        ));

        tracing::info!(
            push_url = %config.push_ws_url,
            backend_url = %config.backend_http_url,
            channels = config.push_channels.len(),
            "Engine started"
        );

        let state = AppState {
            connection: connection.watch_state(),
            config,
            store,
            queue,
            dispatcher,
            operator,
            ws_tx,
            metrics_handle,
        };

        Ok(Self {
            state,
            connection,
            shutdown_tx,
            tasks,
        })
    }

    pub fn app_state(&self) -> AppState {
        self.state.clone()
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Signal every task and wait up to `grace` for each to finish. Tasks
    /// still running after that are aborted.
    pub async fn shutdown(self, grace: Duration) {
        tracing::info!("Engine shutting down");
        let _ = self.shutdown_tx.send(true);

        for (name, handle) in self.tasks {
            let abort = handle.abort_handle();
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => tracing::debug!(task = name, "Task stopped"),
                Ok(Err(e)) => tracing::error!(task = name, error = %e, "Task panicked"),
                Err(_) => {
                    tracing::warn!(task = name, "Task did not stop in time, aborting");
                    abort.abort();
                }
            }
        }

        tracing::info!("Engine stopped");
    }
}

/// Journal-backed queue: commands left `executing` by a previous process are
/// failed, `pending` ones are picked up again.
async fn restore_queue(pool: PgPool) -> anyhow::Result<CommandQueue> {
    let interrupted = command_repo::fail_interrupted(&pool).await?;
    let pending = command_repo::load_pending(&pool).await?;
    tracing::info!(
        pending = pending.len(),
        interrupted,
        "Restored command journal"
    );

    let queue = CommandQueue::with_journal(pool);
    queue.restore(pending).await;
    Ok(queue)
}
