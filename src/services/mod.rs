pub mod dashboard_feed;
pub mod operator_actions;
pub mod staleness_sweeper;
pub mod state_poller;

pub use operator_actions::{Applied, BlackoutControl, OperatorActions};
pub use state_poller::SnapshotSource;
