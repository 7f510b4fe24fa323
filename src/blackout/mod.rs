//! Trading restrictions around scheduled market events.
//!
//! [`calculator`] is pure: it answers "is trading allowed for symbol X at
//! instant T" from events, impact margins and overrides handed to it. The
//! state store owns the inputs and calls into it.

pub mod calculator;
pub mod overrides;

pub use calculator::{is_allowed, BlackoutDecision, BlockReason, ImpactConfig};
pub use overrides::{OverrideAudit, OverrideBook, OverrideEndCause};
