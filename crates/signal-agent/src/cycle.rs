use chrono::{DateTime, Utc};
use signal_core::{Signal, SignalError, SignalResult};
use signal_engine::SignalPipeline;
use signal_store::{DedupScope, DuplicateRemover, LifecycleManager};
use tokio::sync::watch;

use crate::metrics::{elapsed_ms, CycleMetrics};

/// One generation cycle: evaluate, rotate the active set, sweep duplicates.
pub struct GenerationCycle {
    pipeline: SignalPipeline,
    lifecycle: LifecycleManager,
    remover: DuplicateRemover,
    ttl_hours: i64,
    symbols: Vec<String>,
}

impl GenerationCycle {
    pub fn new(
        pipeline: SignalPipeline,
        lifecycle: LifecycleManager,
        remover: DuplicateRemover,
        ttl_hours: i64,
        symbols: Vec<String>,
    ) -> Self {
        Self {
            pipeline,
            lifecycle,
            remover,
            ttl_hours,
            symbols,
        }
    }

    /// A cancelled cycle never touches the active set.
    pub async fn run(&self, shutdown: &watch::Receiver<bool>, now: DateTime<Utc>) -> SignalResult<CycleMetrics> {
        let total = CycleMetrics::start_timer();

        let started = CycleMetrics::start_timer();
        let selection = self.pipeline.run(&self.symbols, shutdown, now).await?;
        let mut metrics = CycleMetrics::from_stats(&selection.cycle_id, &selection.stats);
        metrics.evaluate_ms = elapsed_ms(started);

        if *shutdown.borrow() {
            tracing::warn!("Cycle {} cancelled before rotation", selection.cycle_id);
            return Err(SignalError::Cancelled);
        }

        let signals: Vec<Signal> = selection
            .selected
            .iter()
            .map(|s| Signal::from_scored(s, &selection.cycle_id, now, self.ttl_hours))
            .collect();

        let started = CycleMetrics::start_timer();
        let rotation = self.lifecycle.rotate(&signals, now).await?;
        metrics.archived = rotation.archived;
        metrics.inserted = rotation.inserted_ids.len();
        metrics.rotate_ms = elapsed_ms(started);

        // Rotation leaves one cycle in distinct (symbol, direction) slots, so
        // this only removes rows that another writer added to the same table.
        let started = CycleMetrics::start_timer();
        let sweep = self.remover.run(&DedupScope::All, false, now).await?;
        metrics.duplicates_removed = sweep.removed_ids.len();
        metrics.dedup_ms = elapsed_ms(started);

        metrics.total_ms = elapsed_ms(total);
        Ok(metrics)
    }
}
