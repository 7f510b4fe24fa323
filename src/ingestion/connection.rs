use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::backend::{InboundMessage, OutboundMessage};
use crate::config::AppConfig;
use crate::errors::{ConnectionError, SendError};
use crate::models::{ConnectionPhase, ConnectionState};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OUTBOUND_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub url: String,
    pub auth_token: Option<String>,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl ConnectionConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            url: config.push_ws_url.clone(),
            auth_token: config.backend_auth_token.clone(),
            reconnect_base: config.reconnect_base,
            reconnect_max: config.reconnect_max,
            connect_timeout: config.connect_timeout,
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_timeout: config.heartbeat_timeout,
        }
    }
}

#[derive(Debug, Default)]
struct Subscriptions {
    channels: BTreeSet<String>,
    price_symbols: BTreeSet<String>,
}

/// Delay before reconnect attempt `attempt` (zero-based): `base * 2^attempt`
/// capped at `max`, then scaled by `jitter` (clamped to `0.5..=1.0`).
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration, jitter: f64) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(attempt)).min(max);
    exp.mul_f64(jitter.clamp(0.5, 1.0))
}

/// Owns the push channel: connects, authenticates, replays subscriptions on
/// every (re)connect, keeps the link alive with ping/pong and reconnects
/// with jittered exponential backoff.
///
/// State transitions are published on a `watch` channel; errors never
/// escape [`ConnectionManager::run`].
pub struct ConnectionManager {
    config: ConnectionConfig,
    state_tx: watch::Sender<ConnectionState>,
    subscriptions: Mutex<Subscriptions>,
    outbound: Mutex<Option<mpsc::Sender<OutboundMessage>>>,
    inbound: mpsc::Sender<InboundMessage>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, inbound: mpsc::Sender<InboundMessage>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::default());
        Self {
            config,
            state_tx,
            subscriptions: Mutex::new(Subscriptions::default()),
            outbound: Mutex::new(None),
            inbound,
        }
    }

    fn subscriptions(&self) -> MutexGuard<'_, Subscriptions> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn outbound(&self) -> MutexGuard<'_, Option<mpsc::Sender<OutboundMessage>>> {
        self.outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register interest in `channel`. Sent right away when connected and
    /// replayed after every reconnect.
    pub fn subscribe(&self, channel: &str) {
        let mut subs = self.subscriptions();
        if !subs.channels.insert(channel.to_string()) {
            return;
        }
        let msg = OutboundMessage::Subscribe {
            channels: vec![channel.to_string()],
        };
        if let Some(tx) = self.outbound().as_ref() {
            // The replay on the next connection covers a full buffer.
            let _ = tx.try_send(msg);
        }
    }

    pub fn subscribe_prices(&self, symbols: &[String]) {
        let mut subs = self.subscriptions();
        let added: Vec<String> = symbols
            .iter()
            .map(|s| s.to_ascii_uppercase())
            .filter(|s| subs.price_symbols.insert(s.clone()))
            .collect();
        if added.is_empty() {
            return;
        }
        if let Some(tx) = self.outbound().as_ref() {
            let _ = tx.try_send(OutboundMessage::SubscribePrices { symbols: added });
        }
    }

    /// Queue `message` on the live connection. Never waits: a missing link
    /// or a full buffer is reported to the caller, who owns retry.
    pub fn send(&self, message: OutboundMessage) -> Result<(), SendError> {
        let guard = self.outbound();
        let tx = guard.as_ref().ok_or(SendError::NotConnected)?;
        tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::BufferFull,
            mpsc::error::TrySendError::Closed(_) => SendError::NotConnected,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Install the outbound sender for a fresh connection and return the
    /// messages that must go out before anything else: auth, then replay.
    /// Done under the subscriptions lock so a concurrent `subscribe` is
    /// either in the replay or sent through the new sender.
    fn install_outbound(&self, tx: mpsc::Sender<OutboundMessage>) -> Vec<OutboundMessage> {
        let subs = self.subscriptions();
        *self.outbound() = Some(tx);

        let mut messages = Vec::new();
        if let Some(token) = &self.config.auth_token {
            messages.push(OutboundMessage::Auth {
                token: token.clone(),
            });
        }
        if !subs.channels.is_empty() {
            messages.push(OutboundMessage::Subscribe {
                channels: subs.channels.iter().cloned().collect(),
            });
        }
        if !subs.price_symbols.is_empty() {
            messages.push(OutboundMessage::SubscribePrices {
                symbols: subs.price_symbols.iter().cloned().collect(),
            });
        }
        messages
    }

    fn clear_outbound(&self) {
        *self.outbound() = None;
    }

    fn set_phase(&self, phase: ConnectionPhase, error: Option<String>, attempts: u32) {
        self.state_tx.send_modify(|state| {
            state.phase = phase;
            state.reconnect_attempts = attempts;
            if error.is_some() {
                state.last_error = error;
            }
            match phase {
                ConnectionPhase::Connected => {
                    state.last_error = None;
                    state.connected_since = Some(Utc::now());
                }
                _ => state.connected_since = None,
            }
        });
        gauge!("push_connected").set(if phase == ConnectionPhase::Connected { 1.0 } else { 0.0 });
    }

    /// Connection loop. Returns once `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut attempt: u32 = 0;
        let mut ever_live = false;

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_phase(ConnectionPhase::Connecting, None, attempt);
            tracing::info!(url = %self.config.url, attempt, "Connecting to push channel");

            let error = match self.session(&mut attempt, &mut shutdown).await {
                Ok(()) => break,
                Err(e) => e,
            };

            ever_live |= self.state_tx.borrow().phase == ConnectionPhase::Connected;
            let phase = if ever_live {
                ConnectionPhase::Degraded
            } else {
                ConnectionPhase::Disconnected
            };

            let jitter = rand::thread_rng().gen_range(0.5..=1.0);
            let delay = backoff_delay(
                attempt,
                self.config.reconnect_base,
                self.config.reconnect_max,
                jitter,
            );
            attempt = attempt.saturating_add(1);
            counter!("reconnects_total").increment(1);
            self.set_phase(phase, Some(error.to_string()), attempt);

            tracing::warn!(
                error = %error,
                phase = %phase,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Push channel down, reconnecting"
            );

            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.clear_outbound();
        self.set_phase(ConnectionPhase::Disconnected, None, 0);
        tracing::info!("Connection manager stopped");
    }

    /// One connection lifetime. `Ok` only on shutdown.
    async fn session(
        &self,
        attempt: &mut u32,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), ConnectionError> {
        let handshake = timeout(self.config.connect_timeout, connect_async(self.config.url.as_str()));
        let (ws, _response) = tokio::select! {
            result = handshake => result
                .map_err(|_| ConnectionError::ConnectTimeout(self.config.connect_timeout))??,
            _ = shutdown.changed() => return Ok(()),
        };

        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let replay = self.install_outbound(out_tx);
        let result = self.serve(ws, replay, out_rx, attempt, shutdown).await;
        self.clear_outbound();
        result
    }

    async fn serve(
        &self,
        ws: WsStream,
        replay: Vec<OutboundMessage>,
        mut out_rx: mpsc::Receiver<OutboundMessage>,
        attempt: &mut u32,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), ConnectionError> {
        let (mut write, mut read) = ws.split();

        let replayed = replay.len();
        for msg in &replay {
            write.send(encode(msg)?).await?;
        }

        *attempt = 0;
        self.set_phase(ConnectionPhase::Connected, None, 0);
        tracing::info!(replayed, "Push channel connected");

        let mut ping_timer = interval(self.config.heartbeat_interval);
        ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping_timer.tick().await;
        let mut pong_deadline: Option<Instant> = None;

        loop {
            let deadline = pong_deadline;
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.dispatch_text(text.as_str()).await,
                    Some(Ok(Message::Ping(data))) => write.send(Message::Pong(data)).await?,
                    Some(Ok(Message::Pong(_))) => pong_deadline = None,
                    Some(Ok(Message::Close(_))) | None => return Err(ConnectionError::Closed),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
                out = out_rx.recv() => match out {
                    Some(msg) => write.send(encode(&msg)?).await?,
                    None => return Err(ConnectionError::Closed),
                },
                _ = ping_timer.tick() => {
                    write.send(Message::Ping(Vec::new().into())).await?;
                    if pong_deadline.is_none() {
                        pong_deadline = Some(Instant::now() + self.config.heartbeat_timeout);
                    }
                }
                _ = pong_wait(deadline) => {
                    return Err(ConnectionError::HeartbeatTimeout(self.config.heartbeat_timeout));
                }
                _ = shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }

    async fn dispatch_text(&self, text: &str) {
        let msg = match serde_json::from_str::<InboundMessage>(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(error = %e, raw = %text, "Ignoring unrecognised push message");
                return;
            }
        };

        counter!(
            "push_messages_total",
            "type" => msg.kind(),
            "channel" => msg.channel().unwrap_or("control")
        )
        .increment(1);
        if self.inbound.send(msg).await.is_err() {
            tracing::warn!("Inbound pipeline closed, dropping push message");
        }
    }
}

async fn pong_wait(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn encode(msg: &OutboundMessage) -> Result<Message, ConnectionError> {
    Ok(Message::Text(serde_json::to_string(msg)?.into()))
}
