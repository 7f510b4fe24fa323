use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, RequestBuilder};

use super::types::{
    AccountStats, AgentList, CommandResponse, ImpactConfigList, NewsList, OverrideDisableBody,
    OverrideEnableBody, SingleCommandBody,
};
use crate::errors::{BackendError, DeliveryError};
use crate::execution::delivery::CommandSink;
use crate::models::{
    AccountSummary, Agent, AgentKey, Command, ImpactMargins, ManualOverride, NewsEvent,
};
use crate::services::operator_actions::BlackoutControl;
use crate::services::state_poller::SnapshotSource;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Client for the backend HTTP surface that fronts the agents.
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to build tuned HTTP client, using defaults");
                Client::new()
            });

        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    pub async fn get_agents(&self) -> Result<Vec<Agent>, BackendError> {
        let resp = self
            .authorize(self.http.get(self.url("/api/eas")))
            .send()
            .await?
            .error_for_status()?;
        let list: AgentList = resp.json().await?;
        Ok(list.into_agents())
    }

    pub async fn get_account(&self) -> Result<AccountSummary, BackendError> {
        let resp = self
            .authorize(self.http.get(self.url("/api/stats")))
            .send()
            .await?
            .error_for_status()?;
        let stats: AccountStats = resp.json().await?;
        Ok(AccountSummary {
            balance: stats.balance,
            equity: stats.equity,
            free_margin: stats.free_margin,
            updated_at: stats.timestamp.unwrap_or_else(Utc::now),
        })
    }

    pub async fn get_news_events(&self) -> Result<Vec<NewsEvent>, BackendError> {
        let resp = self
            .authorize(self.http.get(self.url("/api/news/events")))
            .send()
            .await?
            .error_for_status()?;
        let list: NewsList = resp.json().await?;
        Ok(list.into_events())
    }

    pub async fn get_news_config(&self) -> Result<Vec<ImpactMargins>, BackendError> {
        let resp = self
            .authorize(self.http.get(self.url("/api/news/config")))
            .send()
            .await?
            .error_for_status()?;
        let list: ImpactConfigList = resp.json().await?;
        Ok(list.into_margins())
    }

    pub async fn put_news_config(&self, margins: &ImpactMargins) -> Result<(), BackendError> {
        self.authorize(self.http.put(self.url("/api/news/config")))
            .json(margins)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn enable_override(
        &self,
        symbol: &str,
        duration_minutes: u32,
        reason: &str,
    ) -> Result<(), BackendError> {
        let body = OverrideEnableBody {
            symbol,
            duration_minutes,
            reason,
        };
        self.authorize(self.http.post(self.url("/api/news/override/enable")))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn disable_override(&self, symbol: &str) -> Result<(), BackendError> {
        self.authorize(self.http.post(self.url("/api/news/override/disable")))
            .json(&OverrideDisableBody { symbol })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Send one command to one agent.
    pub async fn send_command(&self, agent: &AgentKey, command: &Command) -> Result<(), BackendError> {
        let body = SingleCommandBody {
            command: command.kind.name(),
            parameters: command.kind.parameters(),
            instance_uuid: &agent.instance_uuid,
            command_id: command.id,
        };
        let url = self.url(&format!("/api/eas/{}/command", agent.magic_number));
        let resp = self
            .authorize(self.http.post(url))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let ack: CommandResponse = resp.json().await?;
        if ack.success {
            Ok(())
        } else {
            Err(BackendError::Rejected(
                ack.message.unwrap_or_else(|| "no reason given".into()),
            ))
        }
    }
}

#[async_trait]
impl SnapshotSource for BackendClient {
    async fn fetch_agents(&self) -> Result<Vec<Agent>, BackendError> {
        self.get_agents().await
    }

    async fn fetch_account(&self) -> Result<AccountSummary, BackendError> {
        self.get_account().await
    }

    async fn fetch_news(&self) -> Result<Vec<NewsEvent>, BackendError> {
        self.get_news_events().await
    }

    async fn fetch_impact_config(&self) -> Result<Vec<ImpactMargins>, BackendError> {
        self.get_news_config().await
    }
}

#[async_trait]
impl CommandSink for BackendClient {
    async fn deliver(&self, agent: &AgentKey, command: &Command) -> Result<(), DeliveryError> {
        self.send_command(agent, command).await.map_err(|e| match e {
            BackendError::Rejected(reason) => DeliveryError::Rejected(reason),
            BackendError::Http(err) if err.is_timeout() => DeliveryError::Timeout(REQUEST_TIMEOUT),
            BackendError::Http(err) => DeliveryError::Transport(err.to_string()),
        })
    }
}

#[async_trait]
impl BlackoutControl for BackendClient {
    async fn push_override(&self, ov: &ManualOverride, duration_minutes: u32) -> Result<(), BackendError> {
        self.enable_override(&ov.symbol, duration_minutes, &ov.reason).await
    }

    async fn push_override_removal(&self, symbol: &str) -> Result<(), BackendError> {
        self.disable_override(symbol).await
    }

    async fn push_impact_margins(&self, margins: &ImpactMargins) -> Result<(), BackendError> {
        self.put_news_config(margins).await
    }
}
