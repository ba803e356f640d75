use signal_core::{
    Candidate, Direction, EngineConfig, FusedSignal, FusionMetadata, FusionWeights, MlPrediction,
    WeightOverride,
};

/// Neutral value used for any missing or non-finite confidence.
const NEUTRAL: f64 = 0.5;

/// Blends a rule-based candidate with an optional ML prediction.
pub struct FusionEngine {
    config: EngineConfig,
}

impl FusionEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Never fails: malformed inputs degrade to neutral defaults.
    pub fn fuse(&self, candidate: Candidate, prediction: Option<MlPrediction>) -> FusedSignal {
        let rule = neutral_if_missing(candidate.confidence);

        let prediction = prediction.filter(|p| {
            let ok = p.is_well_formed(self.config.probability_epsilon);
            if !ok {
                tracing::warn!(
                    "Ignoring malformed ML prediction for {} (probabilities do not sum to 1)",
                    p.symbol
                );
            }
            ok
        });

        let Some(p) = prediction else {
            return FusedSignal {
                fused_strength: rule,
                fused_confidence: rule,
                agreement_level: 1.0,
                position_size_multiplier: position_size_multiplier(rule, NEUTRAL),
                metadata: FusionMetadata {
                    rule_strength: rule,
                    rule_confidence: rule,
                    ml_strength: None,
                    ml_confidence: None,
                    rule_weight: 1.0,
                    ml_weight: 0.0,
                    weight_override: WeightOverride::NoPrediction,
                    strong_agreement: false,
                },
                candidate,
                prediction: None,
            };
        };

        let ml_confidence = neutral_if_missing(p.confidence);
        let ml_strength = directional_strength(candidate.direction, p.predicted_direction, ml_confidence);

        let (raw, weight_override) = self.select_weights(rule, ml_confidence);
        let w = raw.normalized();

        let fused_strength = (rule * w.rule + ml_strength * w.ml).clamp(0.0, 1.0);
        let fused_confidence = (rule * w.rule + ml_confidence * w.ml).clamp(0.0, 1.0);
        let (agreement_level, strong_agreement) = self.agreement(rule, ml_strength);

        tracing::debug!(
            "Fused {} {}: rule={:.3} ml={:.3} w=({:.2},{:.2}) strength={:.3} agreement={:.3}",
            candidate.symbol,
            candidate.direction,
            rule,
            ml_strength,
            w.rule,
            w.ml,
            fused_strength,
            agreement_level
        );

        FusedSignal {
            fused_strength,
            fused_confidence,
            agreement_level,
            position_size_multiplier: position_size_multiplier(fused_strength, ml_confidence),
            metadata: FusionMetadata {
                rule_strength: rule,
                rule_confidence: rule,
                ml_strength: Some(ml_strength),
                ml_confidence: Some(ml_confidence),
                rule_weight: w.rule,
                ml_weight: w.ml,
                weight_override,
                strong_agreement,
            },
            candidate,
            prediction: Some(p),
        }
    }

    /// Raw weights before normalization. A weak side loses weight to the other;
    /// when both sides are weak neither dominates.
    fn select_weights(&self, rule: f64, ml_confidence: f64) -> (FusionWeights, WeightOverride) {
        let ml_weak = ml_confidence < self.config.min_ml_confidence;
        let rule_weak = rule < self.config.min_rule_strength;

        match (ml_weak, rule_weak) {
            (true, true) => (self.config.both_weak_weights, WeightOverride::BothWeak),
            (true, false) => (
                self.config.low_ml_confidence_weights,
                WeightOverride::LowMlConfidence,
            ),
            (false, true) => (
                self.config.low_rule_strength_weights,
                WeightOverride::LowRuleStrength,
            ),
            (false, false) => (self.config.base_weights, WeightOverride::None),
        }
    }

    fn agreement(&self, rule: f64, ml_strength: f64) -> (f64, bool) {
        let base = 1.0 - (rule - ml_strength).abs();
        let high = self.config.strong_agreement_high;
        let low = self.config.strong_agreement_low;
        let strong = (rule > high && ml_strength > high) || (rule < low && ml_strength < low);

        let level = if strong {
            (base + self.config.agreement_bonus).min(1.0)
        } else {
            base
        };
        (level.clamp(0.0, 1.0), strong)
    }
}

/// ML strength expressed in the candidate's direction.
fn directional_strength(candidate: Direction, predicted: Direction, ml_confidence: f64) -> f64 {
    if predicted == Direction::Hold {
        NEUTRAL
    } else if predicted == candidate {
        ml_confidence
    } else {
        1.0 - ml_confidence
    }
}

fn neutral_if_missing(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        NEUTRAL
    }
}

fn position_size_multiplier(fused_strength: f64, ml_confidence: f64) -> f64 {
    (fused_strength * (1.0 + (ml_confidence - 0.5) * 1.5)).clamp(0.1, 2.0)
}
