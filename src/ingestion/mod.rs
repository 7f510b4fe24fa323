pub mod connection;
pub mod pipeline;

pub use connection::{backoff_delay, ConnectionConfig, ConnectionManager};
pub use pipeline::{handle_message, run_pipeline};
