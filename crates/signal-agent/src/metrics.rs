use std::collections::BTreeMap;
use std::time::Instant;

use signal_core::RejectReason;
use signal_engine::CycleStats;

/// Telemetry for one generation cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleMetrics {
    pub cycle_id: String,
    pub symbols: usize,
    pub candidates_seen: usize,
    pub invalid: usize,
    pub provider_timeouts: usize,
    pub provider_errors: usize,
    pub worker_failures: usize,
    pub rejected: BTreeMap<RejectReason, usize>,
    pub accepted: usize,
    pub selected: usize,
    pub archived: u64,
    pub inserted: usize,
    pub duplicates_removed: usize,

    // Stage timings
    pub evaluate_ms: u64,
    pub rotate_ms: u64,
    pub dedup_ms: u64,
    pub total_ms: u64,
}

impl CycleMetrics {
    pub fn start_timer() -> Instant {
        Instant::now()
    }

    pub fn from_stats(cycle_id: &str, stats: &CycleStats) -> Self {
        Self {
            cycle_id: cycle_id.to_string(),
            symbols: stats.symbols,
            candidates_seen: stats.candidates_seen,
            invalid: stats.invalid,
            provider_timeouts: stats.provider_timeouts,
            provider_errors: stats.provider_errors,
            worker_failures: stats.worker_failures,
            rejected: stats.rejected.clone(),
            accepted: stats.accepted,
            selected: stats.selected,
            ..Self::default()
        }
    }

    pub fn total_rejected(&self) -> usize {
        self.rejected.values().sum()
    }

    fn rejected_count(&self, reason: RejectReason) -> usize {
        self.rejected.get(&reason).copied().unwrap_or(0)
    }

    /// Emit structured telemetry via tracing
    pub fn log(&self) {
        tracing::info!(
            cycle_id = %self.cycle_id,
            symbols = self.symbols,
            candidates = self.candidates_seen,
            invalid = self.invalid,
            rejected = self.total_rejected(),
            provider_timeouts = self.provider_timeouts,
            provider_errors = self.provider_errors,
            worker_failures = self.worker_failures,
            rejected_low_confidence = self.rejected_count(RejectReason::LowConfidence),
            rejected_low_rr = self.rejected_count(RejectReason::LowRr),
            rejected_stale_data = self.rejected_count(RejectReason::StaleData),
            rejected_low_agreement = self.rejected_count(RejectReason::LowAgreement),
            accepted = self.accepted,
            selected = self.selected,
            archived = self.archived,
            inserted = self.inserted,
            duplicates_removed = self.duplicates_removed,
            evaluate_ms = self.evaluate_ms,
            rotate_ms = self.rotate_ms,
            dedup_ms = self.dedup_ms,
            total_ms = self.total_ms,
            "Generation cycle metrics"
        );
    }

    /// Serialize metrics to JSON for the run log
    pub fn to_json(&self) -> serde_json::Value {
        let rejected: BTreeMap<&str, usize> = self
            .rejected
            .iter()
            .map(|(reason, count)| (reason.as_str(), *count))
            .collect();
        serde_json::json!({
            "cycle_id": self.cycle_id,
            "symbols": self.symbols,
            "candidates_seen": self.candidates_seen,
            "invalid": self.invalid,
            "provider_timeouts": self.provider_timeouts,
            "provider_errors": self.provider_errors,
            "worker_failures": self.worker_failures,
            "rejected": rejected,
            "accepted": self.accepted,
            "selected": self.selected,
            "archived": self.archived,
            "inserted": self.inserted,
            "duplicates_removed": self.duplicates_removed,
            "timings_ms": {
                "evaluate": self.evaluate_ms,
                "rotate": self.rotate_ms,
                "dedup": self.dedup_ms,
                "total": self.total_ms,
            },
        })
    }
}

pub fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_stats_and_json() {
        let mut stats = CycleStats {
            symbols: 3,
            candidates_seen: 7,
            accepted: 4,
            selected: 2,
            ..CycleStats::default()
        };
        stats.rejected.insert(RejectReason::LowRr, 2);
        stats.rejected.insert(RejectReason::StaleData, 1);

        let mut metrics = CycleMetrics::from_stats("c-1", &stats);
        metrics.archived = 5;
        assert_eq!(metrics.total_rejected(), 3);

        let json = metrics.to_json();
        assert_eq!(json["rejected"]["LOW_RR"], 2);
        assert_eq!(json["archived"], 5);
        assert_eq!(json["candidates_seen"], 7);
    }
}
