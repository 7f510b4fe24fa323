use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, gauge};
use serde::Serialize;
use tokio::sync::{watch, RwLock, RwLockWriteGuard};

use crate::blackout::{self, BlackoutDecision, ImpactConfig, OverrideAudit, OverrideBook};
use crate::errors::StaleDataError;
use crate::models::{
    AccountSummary, Agent, AgentKey, GlobalStats, ImpactMargins, ManualOverride, NewsEvent,
    PriceTick,
};

/// News events are dropped this long after their scheduled time.
const NEWS_RETENTION_HOURS: i64 = 24;
/// Tombstones only need to outlive any in-flight snapshot.
const TOMBSTONE_RETENTION_HOURS: i64 = 24;

/// One incremental change, from the push channel or an operator action.
#[derive(Debug, Clone)]
pub enum Delta {
    Agents(Vec<Agent>),
    Account(AccountSummary),
    News(Vec<NewsEvent>),
    ImpactMargins(Vec<ImpactMargins>),
    Price(PriceTick),
    OverrideEnabled(ManualOverride),
    OverrideDisabled { symbol: String },
    /// Remove agents not seen for `stale_after`, expire ended overrides and
    /// old news. The only way agents leave the store.
    StalenessSweep {
        now: DateTime<Utc>,
        stale_after: Duration,
    },
}

impl Delta {
    pub fn kind(&self) -> &'static str {
        match self {
            Delta::Agents(_) => "agents",
            Delta::Account(_) => "account",
            Delta::News(_) => "news",
            Delta::ImpactMargins(_) => "impact_margins",
            Delta::Price(_) => "price",
            Delta::OverrideEnabled(_) => "override_enabled",
            Delta::OverrideDisabled { .. } => "override_disabled",
            Delta::StalenessSweep { .. } => "staleness_sweep",
        }
    }
}

/// Authoritative (possibly partial) state fetched by the poller. Absent
/// sections are left untouched; present sections never delete entities.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub agents: Option<Vec<Agent>>,
    pub account: Option<AccountSummary>,
    pub news: Option<Vec<NewsEvent>>,
    pub impact_margins: Option<Vec<ImpactMargins>>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.agents.is_none()
            && self.account.is_none()
            && self.news.is_none()
            && self.impact_margins.is_none()
    }
}

#[derive(Debug, Default)]
pub struct MergeReport {
    pub applied: usize,
    pub stale: Vec<StaleDataError>,
    pub removed: Vec<AgentKey>,
    /// The override an `OverrideDisabled` delta actually removed.
    pub disabled: Option<ManualOverride>,
}

impl MergeReport {
    pub fn changed(&self) -> bool {
        self.applied > 0 || !self.removed.is_empty()
    }
}

/// Consistent read of the store at one version.
#[derive(Debug, Clone, Serialize)]
pub struct StateView {
    pub version: u64,
    pub agents: Vec<Agent>,
    pub stats: GlobalStats,
    pub account: Option<AccountSummary>,
}

#[derive(Default)]
struct StoreInner {
    version: u64,
    agents: BTreeMap<AgentKey, Agent>,
    tombstones: HashMap<AgentKey, DateTime<Utc>>,
    account: Option<AccountSummary>,
    news: Vec<NewsEvent>,
    news_ids: HashSet<String>,
    impact: ImpactConfig,
    overrides: OverrideBook,
    prices: HashMap<String, PriceTick>,
}

impl StoreInner {
    fn apply(&mut self, delta: Delta, report: &mut MergeReport) {
        match delta {
            Delta::Agents(agents) => {
                for agent in agents {
                    self.merge_agent(agent, report);
                }
            }
            Delta::Account(account) => self.merge_account(account, report),
            Delta::News(events) => {
                for event in events {
                    if self.news_ids.insert(event.id.clone()) {
                        self.news.push(event);
                        report.applied += 1;
                    }
                }
            }
            Delta::ImpactMargins(margins) => {
                for m in margins {
                    if self.impact.set(m) {
                        report.applied += 1;
                    }
                }
            }
            Delta::Price(tick) => self.merge_price(tick, report),
            Delta::OverrideEnabled(ov) => {
                self.overrides.enable(ov, Utc::now());
                report.applied += 1;
            }
            Delta::OverrideDisabled { symbol } => {
                report.disabled = self.overrides.disable(&symbol, Utc::now());
                if report.disabled.is_some() {
                    report.applied += 1;
                }
            }
            Delta::StalenessSweep { now, stale_after } => self.sweep(now, stale_after, report),
        }
    }

    /// Last-writer-wins by `last_seen`; ties go to the later arrival.
    fn merge_agent(&mut self, agent: Agent, report: &mut MergeReport) {
        let key = agent.key();

        let stored = match self.agents.get(&key) {
            Some(existing) => Some(existing.last_seen),
            None => self.tombstones.get(&key).copied(),
        };
        if let Some(stored) = stored {
            let tombstoned = !self.agents.contains_key(&key);
            if agent.last_seen < stored || (tombstoned && agent.last_seen == stored) {
                report.stale.push(StaleDataError {
                    entity: format!("agent {key}"),
                    incoming: agent.last_seen,
                    stored,
                });
                return;
            }
        }

        // A poll repeating what push already delivered is not a change.
        if self.agents.get(&key) == Some(&agent) {
            return;
        }

        self.tombstones.remove(&key);
        self.agents.insert(key, agent);
        report.applied += 1;
    }

    fn merge_account(&mut self, account: AccountSummary, report: &mut MergeReport) {
        if let Some(existing) = &self.account {
            if account.updated_at < existing.updated_at {
                report.stale.push(StaleDataError {
                    entity: "account".into(),
                    incoming: account.updated_at,
                    stored: existing.updated_at,
                });
                return;
            }
            if *existing == account {
                return;
            }
        }
        self.account = Some(account);
        report.applied += 1;
    }

    fn merge_price(&mut self, tick: PriceTick, report: &mut MergeReport) {
        let symbol = tick.symbol.to_ascii_uppercase();
        if let Some(existing) = self.prices.get(&symbol) {
            if tick.timestamp < existing.timestamp {
                report.stale.push(StaleDataError {
                    entity: format!("price {symbol}"),
                    incoming: tick.timestamp,
                    stored: existing.timestamp,
                });
                return;
            }
            if *existing == tick {
                return;
            }
        }
        self.prices.insert(symbol, tick);
        report.applied += 1;
    }

    fn sweep(&mut self, now: DateTime<Utc>, stale_after: Duration, report: &mut MergeReport) {
        let cutoff = now - stale_after;
        let stale: Vec<AgentKey> = self
            .agents
            .values()
            .filter(|a| a.last_seen < cutoff)
            .map(Agent::key)
            .collect();

        for key in stale {
            if let Some(agent) = self.agents.remove(&key) {
                tracing::info!(
                    agent = %key,
                    symbol = %agent.symbol,
                    last_seen = %agent.last_seen,
                    "Removing stale agent"
                );
                self.tombstones.insert(key.clone(), agent.last_seen);
                report.removed.push(key);
            }
        }

        let tombstone_cutoff = now - Duration::hours(TOMBSTONE_RETENTION_HOURS);
        self.tombstones.retain(|_, seen| *seen >= tombstone_cutoff);

        report.applied += self.overrides.expire(now).len();

        let news_cutoff = now - Duration::hours(NEWS_RETENTION_HOURS);
        let before = self.news.len();
        let news_ids = &mut self.news_ids;
        self.news.retain(|e| {
            let keep = e.event_time >= news_cutoff;
            if !keep {
                news_ids.remove(&e.id);
            }
            keep
        });
        report.applied += before - self.news.len();
    }
}

/// Single owner of agent, news and override state. All mutation goes
/// through [`StateStore::apply_delta`] and [`StateStore::apply_snapshot`];
/// each call is applied atomically under one write lock.
///
/// Subscribers watch the version counter. A `watch` channel keeps only the
/// latest value, so several merges landing between two polls of a
/// subscriber are seen as one notification.
pub struct StateStore {
    inner: RwLock<StoreInner>,
    version_tx: watch::Sender<u64>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        let (version_tx, _) = watch::channel(0);
        Self {
            inner: RwLock::new(StoreInner::default()),
            version_tx,
        }
    }

    pub async fn apply_delta(&self, delta: Delta) -> MergeReport {
        let source = delta.kind();
        let mut report = MergeReport::default();
        let mut inner = self.inner.write().await;
        inner.apply(delta, &mut report);
        self.commit(inner, source, report)
    }

    pub async fn apply_snapshot(&self, snapshot: Snapshot) -> MergeReport {
        let mut report = MergeReport::default();
        let mut inner = self.inner.write().await;

        if let Some(agents) = snapshot.agents {
            inner.apply(Delta::Agents(agents), &mut report);
        }
        if let Some(account) = snapshot.account {
            inner.apply(Delta::Account(account), &mut report);
        }
        if let Some(news) = snapshot.news {
            inner.apply(Delta::News(news), &mut report);
        }
        if let Some(margins) = snapshot.impact_margins {
            inner.apply(Delta::ImpactMargins(margins), &mut report);
        }

        self.commit(inner, "snapshot", report)
    }

    fn commit(
        &self,
        mut inner: RwLockWriteGuard<'_, StoreInner>,
        source: &str,
        report: MergeReport,
    ) -> MergeReport {
        for stale in &report.stale {
            tracing::debug!(source, error = %stale, "Dropped stale update");
        }
        if !report.stale.is_empty() {
            counter!("stale_updates_dropped_total").increment(report.stale.len() as u64);
        }

        if report.changed() {
            inner.version += 1;
            let version = inner.version;
            let agent_count = inner.agents.len();
            drop(inner);

            gauge!("agents_tracked").set(agent_count as f64);
            self.version_tx.send_replace(version);
        }

        report
    }

    /// Receiver that changes whenever a merge modifies the store.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }

    pub async fn version(&self) -> u64 {
        self.inner.read().await.version
    }

    /// All agents ordered by `(magic_number, instance_uuid)`.
    pub async fn agents(&self) -> Vec<Agent> {
        self.inner.read().await.agents.values().cloned().collect()
    }

    pub async fn agent(&self, key: &AgentKey) -> Option<Agent> {
        self.inner.read().await.agents.get(key).cloned()
    }

    pub async fn global_stats(&self) -> GlobalStats {
        GlobalStats::from_agents(self.inner.read().await.agents.values())
    }

    pub async fn view(&self) -> StateView {
        let inner = self.inner.read().await;
        let agents: Vec<Agent> = inner.agents.values().cloned().collect();
        StateView {
            version: inner.version,
            stats: GlobalStats::from_agents(&agents),
            agents,
            account: inner.account.clone(),
        }
    }

    pub async fn account(&self) -> Option<AccountSummary> {
        self.inner.read().await.account.clone()
    }

    pub async fn news_events(&self) -> Vec<NewsEvent> {
        let mut events = self.inner.read().await.news.clone();
        events.sort_by(|a, b| a.event_time.cmp(&b.event_time).then_with(|| a.id.cmp(&b.id)));
        events
    }

    pub async fn impact_margins(&self) -> Vec<ImpactMargins> {
        self.inner.read().await.impact.all()
    }

    pub async fn overrides(&self) -> Vec<ManualOverride> {
        self.inner.read().await.overrides.active()
    }

    pub async fn override_history(&self) -> Vec<OverrideAudit> {
        self.inner.read().await.overrides.history()
    }

    /// Latest tick per symbol, ordered by symbol.
    pub async fn prices(&self) -> Vec<PriceTick> {
        let inner = self.inner.read().await;
        let mut ticks: Vec<PriceTick> = inner.prices.values().cloned().collect();
        ticks.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        ticks
    }

    pub async fn price(&self, symbol: &str) -> Option<PriceTick> {
        self.inner
            .read()
            .await
            .prices
            .get(&symbol.to_ascii_uppercase())
            .cloned()
    }

    /// Effective blackout decision for each symbol at `at`, from one
    /// consistent read of events, margins and overrides.
    pub async fn blackout(&self, symbols: &[String], at: DateTime<Utc>) -> Vec<(String, BlackoutDecision)> {
        let inner = self.inner.read().await;
        symbols
            .iter()
            .map(|symbol| {
                let decision =
                    blackout::is_allowed(symbol, at, &inner.news, &inner.impact, &inner.overrides);
                (symbol.clone(), decision)
            })
            .collect()
    }
}
