//! Replays published signals against historical daily bars to decide whether
//! their target or stop would have been reached on the day they were issued.

pub mod bars;
pub mod outcomes;
pub mod replay;
pub mod summary;
pub mod verifier;

pub use bars::SqliteBarStore;
pub use outcomes::OutcomeLog;
pub use replay::{pnl_percent, replay, replay_all};
pub use summary::VerificationSummary;
pub use verifier::{BacktestVerifier, Verification};
