use signal_core::{CompositeWeights, FusedSignal, ScoredSignal, FACTOR_NEWS, FACTOR_SENTIMENT};

/// Weighted blend used to rank candidates across symbols.
///
/// Inputs are expected pre-normalized to [0, 1]; no normalization happens
/// here. The risk/reward bonus can push the total slightly above 1.0, so the
/// result is a ranking value rather than a probability.
pub struct CompositeScorer {
    weights: CompositeWeights,
}

impl Default for CompositeScorer {
    fn default() -> Self {
        Self::new(CompositeWeights::default())
    }
}

impl CompositeScorer {
    pub fn new(weights: CompositeWeights) -> Self {
        Self { weights }
    }

    pub fn score(
        &self,
        strategy_confidence: f64,
        quality_score: f64,
        news_score: f64,
        sentiment_score: f64,
        risk_reward_ratio: f64,
    ) -> f64 {
        let w = &self.weights;
        let rr_bonus = (finite_or_zero(risk_reward_ratio) / w.rr_bonus_divisor).min(w.rr_bonus_cap);

        let score = w.strategy_confidence * finite_or_zero(strategy_confidence)
            + w.quality * finite_or_zero(quality_score)
            + w.news * finite_or_zero(news_score)
            + w.sentiment * finite_or_zero(sentiment_score)
            + rr_bonus;

        score.clamp(0.0, w.max_score)
    }

    pub fn score_fused(&self, fused: FusedSignal, quality_score: f64) -> ScoredSignal {
        let c = &fused.candidate;
        let composite_score = self.score(
            fused.fused_confidence,
            quality_score,
            c.factor(FACTOR_NEWS),
            c.factor(FACTOR_SENTIMENT),
            c.risk_reward_ratio,
        );

        ScoredSignal {
            fused,
            quality_score,
            composite_score,
        }
    }
}

fn finite_or_zero(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}
