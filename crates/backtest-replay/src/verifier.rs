use std::sync::Arc;

use chrono::{DateTime, Utc};
use signal_core::{BacktestOutcome, BarStore, Signal, SignalError, SignalResult};
use signal_store::LifecycleManager;

use crate::outcomes::OutcomeLog;
use crate::replay::replay_all;
use crate::summary::VerificationSummary;

#[derive(Debug, Clone)]
pub struct Verification {
    /// One per signal not skipped, in input order
    pub outcomes: Vec<BacktestOutcome>,
    pub summary: VerificationSummary,
    pub marked_executed: usize,
    /// Already executed or already verified
    pub skipped: usize,
}

/// Looks up bars, replays, logs every outcome and records executions.
pub struct BacktestVerifier {
    bars: Arc<dyn BarStore>,
    log: OutcomeLog,
    lifecycle: LifecycleManager,
}

impl BacktestVerifier {
    pub fn new(bars: Arc<dyn BarStore>, log: OutcomeLog, lifecycle: LifecycleManager) -> Self {
        Self { bars, log, lifecycle }
    }

    /// Verify every signal that has no verdict yet.
    ///
    /// Executed signals and signals with a logged non-ERROR outcome are
    /// skipped. Outcomes and executions are committed together.
    pub async fn verify(&self, signals: &[Signal], now: DateTime<Utc>) -> SignalResult<Verification> {
        let verified = self.log.verified_signal_ids().await?;
        let pending: Vec<&Signal> = signals
            .iter()
            .filter(|s| !s.is_executed && !s.id.is_some_and(|id| verified.contains(&id)))
            .collect();
        let skipped = signals.len() - pending.len();

        let mut slots: Vec<Option<BacktestOutcome>> = Vec::with_capacity(pending.len());
        let mut pairs = Vec::new();
        let mut pair_slots = Vec::new();

        for signal in pending {
            match self.bars.daily_bar(&signal.symbol, signal.calendar_date()).await {
                Ok(bar) => {
                    pair_slots.push(slots.len());
                    slots.push(None);
                    pairs.push((signal.clone(), bar));
                }
                Err(e) => {
                    // The signal itself is left alone.
                    tracing::warn!("Bar lookup failed for {} ({:?}): {}", signal.symbol, signal.id, e);
                    slots.push(Some(BacktestOutcome::error(signal, e.to_string())));
                }
            }
        }

        for (slot, outcome) in pair_slots.into_iter().zip(replay_all(&pairs)) {
            slots[slot] = Some(outcome);
        }
        let outcomes: Vec<BacktestOutcome> = slots.into_iter().flatten().collect();

        let mut batch = self.lifecycle.begin().await?;
        OutcomeLog::append_in(batch.connection(), &outcomes, now).await?;

        let mut marked_executed = 0;
        for outcome in outcomes.iter().filter(|o| o.status.is_execution()) {
            let (Some(id), Some(price), Some(at), Some(pnl)) = (
                outcome.signal_id,
                outcome.execution_price,
                outcome.execution_time,
                outcome.pnl_percent,
            ) else {
                continue;
            };

            match batch.mark_executed(id, price, at, pnl).await {
                Ok(()) => marked_executed += 1,
                Err(e @ SignalError::Persistence(_)) => return Err(e),
                Err(e) => tracing::warn!("Signal #{} not marked executed: {}", id, e),
            }
        }
        batch.commit().await?;

        let summary = VerificationSummary::from_outcomes(&outcomes);
        tracing::info!(
            "Verified {} signals ({} skipped): {} target, {} stop, {} end-of-day, {} not executed, {} errors, win rate {:.1}%",
            summary.total,
            skipped,
            summary.target_hits,
            summary.stop_hits,
            summary.end_of_day,
            summary.not_executed,
            summary.errors,
            summary.win_rate
        );

        Ok(Verification {
            outcomes,
            summary,
            marked_executed,
            skipped,
        })
    }
}
