use serde::{Deserialize, Serialize};
use signal_core::{BacktestOutcome, ExecutionStatus};

/// Aggregate view over one verification run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationSummary {
    pub total: usize,
    pub target_hits: usize,
    pub stop_hits: usize,
    pub end_of_day: usize,
    pub not_executed: usize,
    pub errors: usize,
    /// 0-100, over outcomes that produced a P&L
    pub win_rate: f64,
    pub avg_pnl_percent: f64,
}

impl VerificationSummary {
    pub fn from_outcomes(outcomes: &[BacktestOutcome]) -> Self {
        let mut summary = Self {
            total: outcomes.len(),
            ..Self::default()
        };

        for outcome in outcomes {
            match outcome.status {
                ExecutionStatus::TargetHit => summary.target_hits += 1,
                ExecutionStatus::StopLossHit => summary.stop_hits += 1,
                ExecutionStatus::EndOfDay => summary.end_of_day += 1,
                ExecutionStatus::NotExecuted => summary.not_executed += 1,
                ExecutionStatus::Error => summary.errors += 1,
            }
        }

        let pnls: Vec<f64> = outcomes.iter().filter_map(|o| o.pnl_percent).collect();
        if !pnls.is_empty() {
            let wins = pnls.iter().filter(|p| **p > 0.0).count();
            summary.win_rate = wins as f64 / pnls.len() as f64 * 100.0;
            summary.avg_pnl_percent = pnls.iter().sum::<f64>() / pnls.len() as f64;
        }

        summary
    }
}
