pub mod rest_client;
pub mod types;

pub use rest_client::BackendClient;
pub use types::{CommandAck, InboundMessage, OutboundMessage};
