use chrono::{DateTime, Utc};
use signal_core::{EngineConfig, FusedSignal, RejectReason};

/// Gate between fusion and scoring.
pub struct QualityFilter {
    config: EngineConfig,
}

impl QualityFilter {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Returns the quality score of an accepted signal, or the first failing reason.
    ///
    /// Checks run in a fixed order: confidence, risk/reward, data freshness,
    /// then ML agreement (only when a prediction took part in the fusion).
    pub fn evaluate(&self, fused: &FusedSignal, now: DateTime<Utc>) -> Result<f64, RejectReason> {
        let candidate = &fused.candidate;

        if fused.fused_confidence < self.config.min_confidence_threshold {
            return Err(RejectReason::LowConfidence);
        }
        if candidate.risk_reward_ratio < self.config.min_risk_reward_ratio {
            return Err(RejectReason::LowRr);
        }

        let age_secs = candidate.data_age(now).num_seconds();
        if age_secs > self.config.max_data_age_secs {
            return Err(RejectReason::StaleData);
        }

        if fused.has_prediction() && fused.agreement_level < self.config.min_agreement {
            return Err(RejectReason::LowAgreement);
        }

        Ok(self.quality_score(fused, age_secs))
    }

    /// Mean of fused confidence, agreement and data freshness.
    fn quality_score(&self, fused: &FusedSignal, age_secs: i64) -> f64 {
        let freshness =
            (1.0 - age_secs.max(0) as f64 / self.config.max_data_age_secs as f64).clamp(0.0, 1.0);
        ((fused.fused_confidence + fused.agreement_level + freshness) / 3.0).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::FusionEngine;
    use approx::assert_relative_eq;
    use chrono::Duration;
    use rust_decimal_macros::dec;
    use signal_core::{Candidate, Direction, MlPrediction};
    use std::collections::BTreeMap;

    fn fused(confidence: f64, rr: f64, age_secs: i64, ml: Option<(Direction, f64)>) -> FusedSignal {
        let now = Utc::now();
        let candidate = Candidate {
            symbol: "NVDA".to_string(),
            direction: Direction::Buy,
            strategy_id: "momentum".to_string(),
            confidence,
            entry_price: dec!(50),
            target_price: dec!(60),
            stop_loss: dec!(45),
            risk_reward_ratio: rr,
            factor_scores: BTreeMap::new(),
            timestamp: now,
            data_age_secs: Some(age_secs),
        };
        let prediction = ml.map(|(direction, conf)| {
            let mut probabilities = BTreeMap::new();
            probabilities.insert(direction, conf);
            probabilities.insert(
                if direction == Direction::Buy { Direction::Sell } else { Direction::Buy },
                1.0 - conf,
            );
            MlPrediction {
                symbol: "NVDA".to_string(),
                predicted_direction: direction,
                confidence: conf,
                probabilities,
                timestamp: now,
            }
        });
        FusionEngine::new(EngineConfig::default()).fuse(candidate, prediction)
    }

    #[test]
    fn test_accepts_good_candidate() {
        let filter = QualityFilter::new(EngineConfig::default());
        let score = filter.evaluate(&fused(0.8, 2.0, 0, None), Utc::now()).unwrap();
        // (0.8 + 1.0 + 1.0) / 3
        assert_relative_eq!(score, 2.8 / 3.0, epsilon = 1e-9);
    }

    #[test]
    fn test_rejection_reasons() {
        let filter = QualityFilter::new(EngineConfig::default());
        let now = Utc::now();
        assert_eq!(
            filter.evaluate(&fused(0.2, 2.0, 0, None), now),
            Err(RejectReason::LowConfidence)
        );
        assert_eq!(
            filter.evaluate(&fused(0.8, 0.5, 0, None), now),
            Err(RejectReason::LowRr)
        );
        assert_eq!(
            filter.evaluate(&fused(0.8, 2.0, 3 * 3600, None), now),
            Err(RejectReason::StaleData)
        );
        // rule 0.8 vs ml strength 0.1 -> agreement 0.3
        assert_eq!(
            filter.evaluate(&fused(0.8, 2.0, 0, Some((Direction::Sell, 0.9))), now),
            Err(RejectReason::LowAgreement)
        );
    }

    #[test]
    fn test_confidence_checked_before_risk_reward() {
        let filter = QualityFilter::new(EngineConfig::default());
        assert_eq!(
            filter.evaluate(&fused(0.1, 0.1, 99_999, None), Utc::now()),
            Err(RejectReason::LowConfidence)
        );
    }

    #[test]
    fn test_age_from_timestamp_when_not_reported() {
        let filter = QualityFilter::new(EngineConfig::default());
        let mut f = fused(0.8, 2.0, 0, None);
        f.candidate.data_age_secs = None;
        f.candidate.timestamp = Utc::now() - Duration::hours(3);
        assert_eq!(filter.evaluate(&f, Utc::now()), Err(RejectReason::StaleData));
    }
}
