//! SQLite persistence for published signals: the active set, the append-only
//! history, rotation between generation cycles and duplicate removal.
//!
//! Every writer goes through the store's cycle lock, so at most one rotation,
//! sweep or archive mutates the signal set at a time within a process.

pub mod db;
pub mod dedup;
pub mod lifecycle;

pub use db::SignalStore;
pub use dedup::{find_duplicate_groups, DedupReport, DedupScope, DuplicateGroup, DuplicateRemover};
pub use lifecycle::{LifecycleManager, LifecycleTx, RotationReport};

#[cfg(test)]
mod tests;
