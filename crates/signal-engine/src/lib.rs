//! Signal Engine
//!
//! Turns per-symbol strategy candidates into one cycle's ranked selection:
//! ML fusion, quality gating, composite scoring and top-K selection, with
//! per-symbol evaluation fanned out over a bounded worker pool.

pub mod fusion;
pub mod pipeline;
pub mod quality;
pub mod scorer;
pub mod selector;


pub use fusion::FusionEngine;
pub use pipeline::{CycleSelection, CycleStats, Evaluator, Rejection, SignalPipeline, SymbolEvaluation};
pub use quality::QualityFilter;
pub use scorer::CompositeScorer;
pub use selector::TopKSelector;
