pub mod api;
pub mod backend;
pub mod blackout;
pub mod config;
pub mod db;
pub mod engine;
pub mod errors;
pub mod execution;
pub mod ingestion;
pub mod metrics;
pub mod models;
pub mod services;
pub mod state;

use std::sync::Arc;
use tokio::sync::{broadcast, watch};

use crate::api::ws_types::WsMessage;
use crate::config::AppConfig;
use crate::execution::{CommandDispatcher, CommandQueue};
use crate::models::ConnectionState;
use crate::services::OperatorActions;
use crate::state::StateStore;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<StateStore>,
    pub queue: Arc<CommandQueue>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub operator: Arc<OperatorActions>,
    pub connection: watch::Receiver<ConnectionState>,
    pub ws_tx: broadcast::Sender<WsMessage>,
    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
}
