use std::cmp::Ordering;
use std::collections::HashSet;

use signal_core::{Direction, ScoredSignal};

/// Picks the cycle's best `k` signals, at most one per (symbol, direction).
pub struct TopKSelector {
    k: usize,
}

impl TopKSelector {
    pub fn new(k: usize) -> Self {
        Self { k }
    }

    /// Deterministic for a fixed input: score desc, risk/reward desc,
    /// candidate timestamp asc, symbol asc. A lower-ranked entry for an
    /// already filled (symbol, direction) slot is skipped, not counted.
    pub fn select(&self, mut candidates: Vec<ScoredSignal>) -> Vec<ScoredSignal> {
        candidates.sort_by(rank_order);

        let mut taken: HashSet<(String, Direction)> = HashSet::new();
        let mut selected = Vec::with_capacity(self.k.min(candidates.len()));

        for candidate in candidates {
            if selected.len() >= self.k {
                break;
            }
            let slot = (candidate.symbol().to_string(), candidate.direction());
            if !taken.insert(slot) {
                tracing::debug!(
                    "Skipping {} {} (score {:.4}): slot already filled",
                    candidate.symbol(),
                    candidate.direction(),
                    candidate.composite_score
                );
                continue;
            }
            selected.push(candidate);
        }

        selected
    }
}

fn rank_order(a: &ScoredSignal, b: &ScoredSignal) -> Ordering {
    let (ca, cb) = (&a.fused.candidate, &b.fused.candidate);
    b.composite_score
        .total_cmp(&a.composite_score)
        .then_with(|| cb.risk_reward_ratio.total_cmp(&ca.risk_reward_ratio))
        .then_with(|| ca.timestamp.cmp(&cb.timestamp))
        .then_with(|| ca.symbol.cmp(&cb.symbol))
}
