use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

const DEFAULT_PUSH_WS_URL: &str = "ws://127.0.0.1:8765/ws";
const DEFAULT_BACKEND_HTTP_URL: &str = "http://127.0.0.1:8000";
const DEFAULT_CHANNELS: &str = "ea_updates,portfolio,news,commands";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: Option<String>,
    pub api_token: Option<String>,

    // Collaborators
    pub push_ws_url: String,
    pub backend_http_url: String,
    pub backend_auth_token: Option<String>,
    pub push_channels: Vec<String>,
    pub price_symbols: Vec<String>,

    // Connection manager
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,

    // Polling fallback
    pub poll_fast: Duration,
    pub poll_slow: Duration,
    pub agent_stale_after: Duration,

    // Dispatch
    pub delivery_timeout: Duration,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let config = Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: parse_var("PORT", 8080)?,
            database_url: non_empty_var("DATABASE_URL"),
            api_token: non_empty_var("API_TOKEN"),

            push_ws_url: env::var("PUSH_WS_URL").unwrap_or_else(|_| DEFAULT_PUSH_WS_URL.into()),
            backend_http_url: env::var("BACKEND_HTTP_URL")
                .unwrap_or_else(|_| DEFAULT_BACKEND_HTTP_URL.into()),
            backend_auth_token: non_empty_var("BACKEND_AUTH_TOKEN"),
            push_channels: split_list(
                &env::var("PUSH_CHANNELS").unwrap_or_else(|_| DEFAULT_CHANNELS.into()),
            ),
            price_symbols: split_list(&env::var("PRICE_SYMBOLS").unwrap_or_default())
                .into_iter()
                .map(|s| s.to_ascii_uppercase())
                .collect(),

            reconnect_base: Duration::from_millis(parse_var("RECONNECT_BASE_MS", 1_000)?),
            reconnect_max: Duration::from_millis(parse_var("RECONNECT_MAX_MS", 30_000)?),
            connect_timeout: Duration::from_secs(parse_var("CONNECT_TIMEOUT_SECS", 10)?),
            heartbeat_interval: Duration::from_secs(parse_var("HEARTBEAT_INTERVAL_SECS", 15)?),
            heartbeat_timeout: Duration::from_secs(parse_var("HEARTBEAT_TIMEOUT_SECS", 10)?),

            poll_fast: Duration::from_secs(parse_var("POLL_FAST_SECS", 5)?),
            poll_slow: Duration::from_secs(parse_var("POLL_SLOW_SECS", 30)?),
            agent_stale_after: Duration::from_secs(parse_var("AGENT_STALE_SECS", 120)?),

            delivery_timeout: Duration::from_secs(parse_var("DELIVERY_TIMEOUT_SECS", 10)?),
        };
        config.validate()?;
        Ok(config)
    }

    /// Timers built from these values panic or spin on zero.
    pub fn validate(&self) -> anyhow::Result<()> {
        let periods = [
            ("RECONNECT_BASE_MS", self.reconnect_base),
            ("CONNECT_TIMEOUT_SECS", self.connect_timeout),
            ("HEARTBEAT_INTERVAL_SECS", self.heartbeat_interval),
            ("HEARTBEAT_TIMEOUT_SECS", self.heartbeat_timeout),
            ("POLL_FAST_SECS", self.poll_fast),
            ("POLL_SLOW_SECS", self.poll_slow),
            ("AGENT_STALE_SECS", self.agent_stale_after),
            ("DELIVERY_TIMEOUT_SECS", self.delivery_timeout),
        ];
        for (key, value) in periods {
            if value.is_zero() {
                anyhow::bail!("{key} must be greater than zero");
            }
        }
        if self.reconnect_max < self.reconnect_base {
            anyhow::bail!(
                "RECONNECT_MAX_MS ({:?}) must not be below RECONNECT_BASE_MS ({:?})",
                self.reconnect_max,
                self.reconnect_base
            );
        }
        Ok(())
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match non_empty_var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has an invalid value '{raw}'")),
        None => Ok(default),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
