use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::watch;
use tokio::time::sleep;

use crate::errors::BackendError;
use crate::models::{AccountSummary, Agent, ConnectionState, ImpactMargins, NewsEvent};
use crate::state::{Snapshot, StateStore};

/// Authoritative state the poller can fetch.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_agents(&self) -> Result<Vec<Agent>, BackendError>;
    async fn fetch_account(&self) -> Result<AccountSummary, BackendError>;
    async fn fetch_news(&self) -> Result<Vec<NewsEvent>, BackendError>;
    async fn fetch_impact_config(&self) -> Result<Vec<ImpactMargins>, BackendError>;
}

/// Fetch every section concurrently. A failed section is left out of the
/// snapshot; the rest still merge.
pub async fn poll_once(source: &dyn SnapshotSource) -> Snapshot {
    let (agents, account, news, margins) = tokio::join!(
        source.fetch_agents(),
        source.fetch_account(),
        source.fetch_news(),
        source.fetch_impact_config(),
    );

    Snapshot {
        agents: section("agents", agents),
        account: section("account", account),
        news: section("news", news),
        impact_margins: section("impact_config", margins),
    }
}

fn section<T>(name: &'static str, result: Result<T, BackendError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            counter!("poll_failures_total", "section" => name).increment(1);
            tracing::warn!(section = name, error = %e, "Poll fetch failed");
            None
        }
    }
}

/// Polling fallback. Runs every `fast` while the push channel is not
/// connected and every `slow` while it is; any connection state change
/// triggers an immediate poll. Failures never stop the schedule.
pub async fn run_state_poller(
    source: Arc<dyn SnapshotSource>,
    store: Arc<StateStore>,
    mut connection: watch::Receiver<ConnectionState>,
    fast: Duration,
    slow: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(
        fast_secs = fast.as_secs(),
        slow_secs = slow.as_secs(),
        "State poller started"
    );
    let mut watching = true;

    loop {
        let snapshot = tokio::select! {
            snapshot = poll_once(source.as_ref()) => snapshot,
            _ = shutdown.changed() => break,
        };

        if !snapshot.is_empty() {
            let report = store.apply_snapshot(snapshot).await;
            tracing::debug!(
                applied = report.applied,
                stale = report.stale.len(),
                "Merged poll snapshot"
            );
        }

        let period = if connection.borrow_and_update().is_connected() {
            slow
        } else {
            fast
        };

        tokio::select! {
            _ = sleep(period) => {}
            changed = connection.changed(), if watching => {
                if changed.is_err() {
                    watching = false;
                } else {
                    tracing::debug!(
                        phase = %connection.borrow().phase,
                        "Connection state changed, polling now"
                    );
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    tracing::info!("State poller stopped");
}
