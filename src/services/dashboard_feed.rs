use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};

use crate::api::ws_types::{StateSummary, WsMessage};
use crate::models::{Command, ConnectionState};
use crate::state::StateStore;

/// Fan store changes, connection transitions and command transitions out to
/// dashboard clients. Store changes arrive coalesced, so a burst of merges
/// produces one `state_update`.
pub async fn run_dashboard_feed(
    store: Arc<StateStore>,
    mut connection: watch::Receiver<ConnectionState>,
    mut commands: broadcast::Receiver<Command>,
    ws_tx: broadcast::Sender<WsMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut versions = store.subscribe();
    let mut watching_connection = true;
    tracing::info!("Dashboard feed started");

    loop {
        tokio::select! {
            changed = versions.changed() => {
                if changed.is_err() {
                    break;
                }
                publish_state(&store, &connection, &ws_tx).await;
            }
            changed = connection.changed(), if watching_connection => {
                if changed.is_err() {
                    watching_connection = false;
                } else {
                    publish_state(&store, &connection, &ws_tx).await;
                }
            }
            cmd = commands.recv() => match cmd {
                Ok(command) => {
                    let _ = ws_tx.send(WsMessage::CommandUpdate(command));
                }
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Dashboard feed lagged on command updates");
                }
                Err(RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }

    tracing::info!("Dashboard feed stopped");
}

async fn publish_state(
    store: &StateStore,
    connection: &watch::Receiver<ConnectionState>,
    ws_tx: &broadcast::Sender<WsMessage>,
) {
    let view = store.view().await;
    let summary = StateSummary {
        version: view.version,
        stats: view.stats,
        connection: connection.borrow().clone(),
    };
    // No receivers just means no dashboard is open.
    let _ = ws_tx.send(WsMessage::StateUpdate(summary));
}
