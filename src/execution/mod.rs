pub mod command_queue;
pub mod delivery;
pub mod dispatcher;

pub use command_queue::{run_queue_worker, Claim, CommandQueue};
pub use delivery::CommandSink;
pub use dispatcher::{resolve_targets, CommandDispatcher, CommandPreview, ExecutionReport, SymbolDecision};
