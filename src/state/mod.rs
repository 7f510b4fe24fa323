pub mod store;

pub use store::{Delta, MergeReport, Snapshot, StateStore, StateView};
