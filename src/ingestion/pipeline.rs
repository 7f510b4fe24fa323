use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};

use crate::backend::types::PortfolioUpdate;
use crate::backend::InboundMessage;
use crate::execution::CommandQueue;
use crate::models::AccountSummary;
use crate::state::{Delta, Snapshot, StateStore};

/// Consume typed push messages and turn them into store merges or command
/// acknowledgements. Runs until shutdown or until every sender is gone.
pub async fn run_pipeline(
    mut rx: mpsc::Receiver<InboundMessage>,
    store: Arc<StateStore>,
    queue: Arc<CommandQueue>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!("Inbound pipeline started");

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(msg) => handle_message(msg, &store, &queue).await,
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }

    tracing::info!("Inbound pipeline stopped");
}

pub async fn handle_message(msg: InboundMessage, store: &StateStore, queue: &CommandQueue) {
    match msg {
        InboundMessage::EaUpdate(update) => {
            store.apply_delta(Delta::Agents(update.into_agents())).await;
        }
        InboundMessage::PortfolioUpdate(update) => {
            store.apply_snapshot(portfolio_snapshot(update)).await;
        }
        InboundMessage::NewsUpdate(update) => {
            store.apply_delta(Delta::News(update.into_events())).await;
        }
        InboundMessage::PriceUpdate(tick) => {
            store.apply_delta(Delta::Price(tick)).await;
        }
        InboundMessage::CommandUpdate(ack) => {
            if !queue.record_ack(&ack).await {
                tracing::debug!(
                    command_id = %ack.command_id,
                    magic = ack.magic_number,
                    "Acknowledgement for unknown command target"
                );
            }
        }
        InboundMessage::AuthResponse(resp) => {
            if resp.success {
                tracing::info!("Push channel authenticated");
            } else {
                tracing::warn!(
                    message = resp.message.as_deref().unwrap_or(""),
                    "Push channel authentication rejected"
                );
            }
        }
        InboundMessage::PriceSubscriptionResponse(data) => {
            tracing::debug!(response = %data, "Price subscription acknowledged");
        }
    }
}

/// A portfolio update may carry agents, account figures or both. Both go in
/// one merge so subscribers never see one without the other.
fn portfolio_snapshot(update: PortfolioUpdate) -> Snapshot {
    let account = match (update.balance, update.equity) {
        (Some(balance), Some(equity)) => Some(AccountSummary {
            balance,
            equity,
            free_margin: update.free_margin,
            updated_at: update.timestamp.unwrap_or_else(Utc::now),
        }),
        _ => None,
    };

    Snapshot {
        agents: (!update.eas.is_empty()).then_some(update.eas),
        account,
        news: None,
        impact_margins: None,
    }
}
