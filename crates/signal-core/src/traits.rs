use async_trait::async_trait;
use chrono::NaiveDate;

use crate::{Candidate, DailyBar, MlPrediction, SignalResult};

/// Normalizes strategy outputs into candidates, one symbol at a time.
/// An empty vector is a valid answer.
#[async_trait]
pub trait CandidateProvider: Send + Sync {
    async fn candidates(&self, symbol: &str) -> SignalResult<Vec<Candidate>>;
}

/// Zero-or-one ML prediction for a candidate's (symbol, direction, cycle).
#[async_trait]
pub trait PredictionProvider: Send + Sync {
    async fn prediction(&self, candidate: &Candidate) -> SignalResult<Option<MlPrediction>>;
}

/// Historical daily bars. `Ok(None)` means "not found".
#[async_trait]
pub trait BarStore: Send + Sync {
    async fn daily_bar(&self, symbol: &str, date: NaiveDate) -> SignalResult<Option<DailyBar>>;
}

/// Provider used when no ML subsystem is wired in.
pub struct NoPredictions;

#[async_trait]
impl PredictionProvider for NoPredictions {
    async fn prediction(&self, _candidate: &Candidate) -> SignalResult<Option<MlPrediction>> {
        Ok(None)
    }
}
