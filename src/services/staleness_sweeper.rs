use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::interval;

use crate::state::{Delta, StateStore};

/// Periodically removes agents silent for longer than `stale_after`, and
/// expires ended overrides and old news along the way.
pub async fn run_staleness_sweeper(
    store: Arc<StateStore>,
    every: Duration,
    stale_after: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let stale_after = match chrono::Duration::from_std(stale_after) {
        Ok(d) => d,
        Err(e) => {
            tracing::error!(error = %e, "Staleness threshold out of range, sweeper disabled");
            return;
        }
    };

    let mut ticker = interval(every);
    ticker.tick().await;
    tracing::info!(
        every_secs = every.as_secs(),
        stale_after_secs = stale_after.num_seconds(),
        "Staleness sweeper started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let report = store
            .apply_delta(Delta::StalenessSweep {
                now: Utc::now(),
                stale_after,
            })
            .await;

        if !report.removed.is_empty() {
            tracing::info!(removed = report.removed.len(), "Swept stale agents");
        }
    }

    tracing::info!("Staleness sweeper stopped");
}
