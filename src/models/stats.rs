use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::agent::{Agent, AgentStatus};

/// Fleet-wide aggregate. Always derived from an agent set, never stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalStats {
    pub total_agents: usize,
    pub active_agents: usize,
    pub paused_agents: usize,
    pub open_positions: u64,
    pub total_trades: u64,
    pub total_profit: Decimal,
    pub max_drawdown: Decimal,
    pub avg_win_rate: Decimal,
}

impl GlobalStats {
    pub fn from_agents<'a>(agents: impl IntoIterator<Item = &'a Agent>) -> Self {
        let mut stats = GlobalStats::default();
        let mut win_rate_sum = Decimal::ZERO;

        for agent in agents {
            stats.total_agents += 1;
            match agent.status {
                AgentStatus::Active => stats.active_agents += 1,
                AgentStatus::Paused => stats.paused_agents += 1,
            }
            stats.open_positions += u64::from(agent.open_positions);
            stats.total_trades += agent.total_trades;
            stats.total_profit += agent.profit;
            stats.max_drawdown = stats.max_drawdown.max(agent.drawdown);
            win_rate_sum += agent.win_rate;
        }

        if stats.total_agents > 0 {
            stats.avg_win_rate =
                (win_rate_sum / Decimal::from(stats.total_agents as u64)).round_dp(2);
        }

        stats
    }
}
