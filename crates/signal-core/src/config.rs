use serde::{Deserialize, Serialize};

use crate::error::{SignalError, SignalResult};

/// Raw (rule, ml) weight pair. Always normalized before blending.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusionWeights {
    pub rule: f64,
    pub ml: f64,
}

impl FusionWeights {
    pub const fn new(rule: f64, ml: f64) -> Self {
        Self { rule, ml }
    }

    /// Scale to sum to 1.0. A degenerate pair falls back to rule-only.
    pub fn normalized(self) -> Self {
        let total = self.rule + self.ml;
        if !total.is_finite() || total <= 0.0 {
            return Self::new(1.0, 0.0);
        }
        Self::new(self.rule / total, self.ml / total)
    }

    pub fn scaled(self, factor: f64) -> Self {
        Self::new(self.rule * factor, self.ml * factor)
    }
}

/// Weights for the composite ranking score
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompositeWeights {
    pub strategy_confidence: f64,
    pub quality: f64,
    pub news: f64,
    pub sentiment: f64,
    /// Upper bound of the risk/reward bonus
    pub rr_bonus_cap: f64,
    /// risk_reward_ratio is divided by this before capping
    pub rr_bonus_divisor: f64,
    pub max_score: f64,
}

impl Default for CompositeWeights {
    fn default() -> Self {
        Self {
            strategy_confidence: 0.4,
            quality: 0.3,
            news: 0.15,
            sentiment: 0.15,
            rr_bonus_cap: 0.1,
            rr_bonus_divisor: 10.0,
            max_score: 1.1,
        }
    }
}

/// Immutable engine thresholds, passed by reference into every stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // Fusion
    pub base_weights: FusionWeights,
    pub low_ml_confidence_weights: FusionWeights,
    pub low_rule_strength_weights: FusionWeights,
    pub both_weak_weights: FusionWeights,
    pub min_ml_confidence: f64,
    pub min_rule_strength: f64,
    pub agreement_bonus: f64,
    pub strong_agreement_high: f64,
    pub strong_agreement_low: f64,
    pub probability_epsilon: f64,
    /// Max distance between candidate and prediction timestamps
    pub prediction_window_secs: i64,

    // Quality filter
    pub min_confidence_threshold: f64,
    pub min_risk_reward_ratio: f64,
    pub max_data_age_secs: i64,
    pub min_agreement: f64,

    // Scoring / selection
    pub composite: CompositeWeights,
    pub top_k: usize,

    // Duplicates
    pub tolerance_percentage: f64,

    // Lifecycle
    pub signal_ttl_hours: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_weights: FusionWeights::new(0.4, 0.6),
            low_ml_confidence_weights: FusionWeights::new(0.8, 0.2),
            low_rule_strength_weights: FusionWeights::new(0.2, 0.8),
            both_weak_weights: FusionWeights::new(0.5, 0.5),
            min_ml_confidence: 0.6,
            min_rule_strength: 0.5,
            agreement_bonus: 0.2,
            strong_agreement_high: 0.6,
            strong_agreement_low: 0.4,
            probability_epsilon: 0.01,
            prediction_window_secs: 3600,
            min_confidence_threshold: 0.3,
            min_risk_reward_ratio: 1.0,
            max_data_age_secs: 2 * 3600,
            min_agreement: 0.5,
            composite: CompositeWeights::default(),
            top_k: 5,
            tolerance_percentage: 0.01,
            signal_ttl_hours: 24,
        }
    }
}

impl EngineConfig {
    /// Deployment preset that publishes ten signals per cycle.
    pub fn extended() -> Self {
        Self {
            top_k: 10,
            ..Self::default()
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn validate(&self) -> SignalResult<()> {
        for (name, w) in [
            ("base_weights", self.base_weights),
            ("low_ml_confidence_weights", self.low_ml_confidence_weights),
            ("low_rule_strength_weights", self.low_rule_strength_weights),
            ("both_weak_weights", self.both_weak_weights),
        ] {
            if w.rule < 0.0 || w.ml < 0.0 || w.rule + w.ml <= 0.0 {
                return Err(SignalError::Config(format!(
                    "{} must be non-negative with a positive sum (got rule={}, ml={})",
                    name, w.rule, w.ml
                )));
            }
        }

        for (name, v) in [
            ("min_ml_confidence", self.min_ml_confidence),
            ("min_rule_strength", self.min_rule_strength),
            ("min_confidence_threshold", self.min_confidence_threshold),
            ("min_agreement", self.min_agreement),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(SignalError::Config(format!(
                    "{} must be within [0, 1] (got {})",
                    name, v
                )));
            }
        }

        if self.min_risk_reward_ratio < 0.0 {
            return Err(SignalError::Config(
                "min_risk_reward_ratio must be >= 0".to_string(),
            ));
        }
        if self.max_data_age_secs <= 0 {
            return Err(SignalError::Config(
                "max_data_age_secs must be positive".to_string(),
            ));
        }
        if self.top_k == 0 {
            return Err(SignalError::Config("top_k must be at least 1".to_string()));
        }
        if !(0.0..1.0).contains(&self.tolerance_percentage) {
            return Err(SignalError::Config(format!(
                "tolerance_percentage must be within [0, 1) (got {})",
                self.tolerance_percentage
            )));
        }
        if self.signal_ttl_hours <= 0 {
            return Err(SignalError::Config(
                "signal_ttl_hours must be positive".to_string(),
            ));
        }
        if self.composite.rr_bonus_divisor <= 0.0 {
            return Err(SignalError::Config(
                "composite.rr_bonus_divisor must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
