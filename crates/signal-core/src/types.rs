use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{SignalError, SignalResult};

pub const FACTOR_NEWS: &str = "news";
pub const FACTOR_SENTIMENT: &str = "sentiment";

/// Trade direction as reported by a strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Buy,
    Sell,
    Hold,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Buy => "BUY",
            Direction::Sell => "SELL",
            Direction::Hold => "HOLD",
        }
    }

    /// HOLD carries no target/stop side and is never published.
    pub fn is_actionable(&self) -> bool {
        !matches!(self, Direction::Hold)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = SignalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace([' ', '-'], "_").as_str() {
            "BUY" | "STRONG_BUY" | "WEAK_BUY" => Ok(Direction::Buy),
            "SELL" | "STRONG_SELL" | "WEAK_SELL" => Ok(Direction::Sell),
            "HOLD" | "NEUTRAL" => Ok(Direction::Hold),
            other => Err(SignalError::Validation(format!("unknown direction '{}'", other))),
        }
    }
}

/// One strategy's opinion for one symbol at one instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub symbol: String,
    pub direction: Direction,
    pub strategy_id: String,
    pub confidence: f64, // 0.0 to 1.0, NaN tolerated (neutral default)
    pub entry_price: Decimal,
    pub target_price: Decimal,
    pub stop_loss: Decimal,
    pub risk_reward_ratio: f64,
    /// technical / sentiment / news / volume / pattern, each 0.0 to 1.0
    #[serde(default)]
    pub factor_scores: BTreeMap<String, f64>,
    pub timestamp: DateTime<Utc>,
    /// Age of the underlying market data as reported by the provider
    #[serde(default)]
    pub data_age_secs: Option<i64>,
}

impl Candidate {
    /// Ingestion check. A failure drops this candidate only.
    pub fn validate(&self) -> SignalResult<()> {
        if self.symbol.trim().is_empty() {
            return Err(SignalError::Validation("empty symbol".to_string()));
        }
        if !self.direction.is_actionable() {
            return Err(SignalError::Validation(format!(
                "{}: HOLD candidates are not actionable",
                self.symbol
            )));
        }
        if self.entry_price <= Decimal::ZERO {
            return Err(SignalError::Validation(format!(
                "{}: entry price must be positive (got {})",
                self.symbol, self.entry_price
            )));
        }
        if self.target_price <= Decimal::ZERO || self.stop_loss <= Decimal::ZERO {
            return Err(SignalError::Validation(format!(
                "{}: target {} and stop {} must be positive",
                self.symbol, self.target_price, self.stop_loss
            )));
        }

        let sides_ok = match self.direction {
            Direction::Buy => {
                self.target_price > self.entry_price && self.entry_price > self.stop_loss
            }
            Direction::Sell => {
                self.target_price < self.entry_price && self.entry_price < self.stop_loss
            }
            Direction::Hold => false,
        };
        if !sides_ok {
            return Err(SignalError::Validation(format!(
                "{} {}: target {} / stop {} on the wrong side of entry {}",
                self.symbol, self.direction, self.target_price, self.stop_loss, self.entry_price
            )));
        }

        if !self.risk_reward_ratio.is_finite() || self.risk_reward_ratio < 0.0 {
            return Err(SignalError::Validation(format!(
                "{}: invalid risk/reward {}",
                self.symbol, self.risk_reward_ratio
            )));
        }
        if self.confidence.is_finite() && !(0.0..=1.0).contains(&self.confidence) {
            return Err(SignalError::Validation(format!(
                "{}: confidence {} outside [0, 1]",
                self.symbol, self.confidence
            )));
        }

        Ok(())
    }

    /// Factor score, 0.0 when the provider did not report it.
    pub fn factor(&self, name: &str) -> f64 {
        self.factor_scores
            .get(name)
            .copied()
            .filter(|v| v.is_finite())
            .unwrap_or(0.0)
    }

    pub fn data_age(&self, now: DateTime<Utc>) -> Duration {
        match self.data_age_secs {
            Some(secs) => Duration::seconds(secs),
            None => now - self.timestamp,
        }
    }
}

/// Output contract of the ML subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlPrediction {
    pub symbol: String,
    pub predicted_direction: Direction,
    pub confidence: f64,
    #[serde(default)]
    pub probabilities: BTreeMap<Direction, f64>,
    pub timestamp: DateTime<Utc>,
}

impl MlPrediction {
    /// Probabilities must sum to 1 within `eps`.
    pub fn is_well_formed(&self, eps: f64) -> bool {
        if self.probabilities.is_empty() {
            return false;
        }
        if self.probabilities.values().any(|p| !p.is_finite() || *p < 0.0) {
            return false;
        }
        let total: f64 = self.probabilities.values().sum();
        (total - 1.0).abs() <= eps
    }

    pub fn pairs_with(&self, candidate: &Candidate, window_secs: i64) -> bool {
        self.symbol == candidate.symbol
            && (self.timestamp - candidate.timestamp).num_seconds().abs() <= window_secs
    }
}

/// Which weight pair the fusion ended up using
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightOverride {
    None,
    LowMlConfidence,
    LowRuleStrength,
    BothWeak,
    NoPrediction,
}

/// Fusion details carried onto the persisted signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionMetadata {
    pub rule_strength: f64,
    pub rule_confidence: f64,
    pub ml_strength: Option<f64>,
    pub ml_confidence: Option<f64>,
    pub rule_weight: f64,
    pub ml_weight: f64,
    pub weight_override: WeightOverride,
    pub strong_agreement: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusedSignal {
    pub candidate: Candidate,
    pub prediction: Option<MlPrediction>,
    pub fused_strength: f64,
    pub fused_confidence: f64,
    pub agreement_level: f64,
    pub position_size_multiplier: f64,
    pub metadata: FusionMetadata,
}

impl FusedSignal {
    pub fn has_prediction(&self) -> bool {
        self.prediction.is_some()
    }
}

/// Why a fused candidate was dropped by the quality filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    LowConfidence,
    LowRr,
    StaleData,
    LowAgreement,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::LowConfidence => "LOW_CONFIDENCE",
            RejectReason::LowRr => "LOW_RR",
            RejectReason::StaleData => "STALE_DATA",
            RejectReason::LowAgreement => "LOW_AGREEMENT",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fused candidate that passed the quality filter, with its ranking score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredSignal {
    pub fused: FusedSignal,
    pub quality_score: f64,
    pub composite_score: f64,
}

impl ScoredSignal {
    pub fn symbol(&self) -> &str {
        &self.fused.candidate.symbol
    }

    pub fn direction(&self) -> Direction {
        self.fused.candidate.direction
    }

    pub fn slot(&self) -> (&str, Direction) {
        (self.symbol(), self.direction())
    }
}

/// Published strength band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalStrength {
    Weak,
    Moderate,
    Strong,
    VeryStrong,
}

impl SignalStrength {
    pub fn from_score(score: f64) -> Self {
        match score {
            s if s >= 0.8 => SignalStrength::VeryStrong,
            s if s >= 0.6 => SignalStrength::Strong,
            s if s >= 0.4 => SignalStrength::Moderate,
            _ => SignalStrength::Weak,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalStrength::Weak => "WEAK",
            SignalStrength::Moderate => "MODERATE",
            SignalStrength::Strong => "STRONG",
            SignalStrength::VeryStrong => "VERY_STRONG",
        }
    }
}

impl FromStr for SignalStrength {
    type Err = SignalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WEAK" => Ok(SignalStrength::Weak),
            "MODERATE" => Ok(SignalStrength::Moderate),
            "STRONG" => Ok(SignalStrength::Strong),
            "VERY_STRONG" => Ok(SignalStrength::VeryStrong),
            other => Err(SignalError::Validation(format!("unknown strength '{}'", other))),
        }
    }
}

/// Derived band of `confidence_score`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfidenceLevel {
    Low,
    Medium,
    High,
    VeryHigh,
}

impl ConfidenceLevel {
    pub fn from_score(score: f64) -> Self {
        match score {
            s if s >= 0.8 => ConfidenceLevel::VeryHigh,
            s if s >= 0.6 => ConfidenceLevel::High,
            s if s >= 0.4 => ConfidenceLevel::Medium,
            _ => ConfidenceLevel::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceLevel::Low => "LOW",
            ConfidenceLevel::Medium => "MEDIUM",
            ConfidenceLevel::High => "HIGH",
            ConfidenceLevel::VeryHigh => "VERY_HIGH",
        }
    }
}

impl FromStr for ConfidenceLevel {
    type Err = SignalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOW" => Ok(ConfidenceLevel::Low),
            "MEDIUM" => Ok(ConfidenceLevel::Medium),
            "HIGH" => Ok(ConfidenceLevel::High),
            "VERY_HIGH" => Ok(ConfidenceLevel::VeryHigh),
            other => Err(SignalError::Validation(format!(
                "unknown confidence level '{}'",
                other
            ))),
        }
    }
}

/// Lifecycle state of a persisted signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalState {
    Created,
    Active,
    Expired,
    Executed,
    Archived,
}

impl SignalState {
    /// Expired and executed records may still be moved to history, nothing else.
    pub fn can_transition_to(self, next: SignalState) -> bool {
        use SignalState::*;
        matches!(
            (self, next),
            (Created, Active)
                | (Active, Expired)
                | (Active, Executed)
                | (Active, Archived)
                | (Expired, Archived)
                | (Executed, Archived)
        )
    }

    pub fn transition(self, next: SignalState) -> SignalResult<SignalState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(SignalError::InvalidTransition {
                from: format!("{:?}", self),
                to: format!("{:?}", next),
            })
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalMetadata {
    pub cycle_id: Option<String>,
    pub strategy_id: Option<String>,
    pub composite_score: Option<f64>,
    pub position_size_multiplier: Option<f64>,
    pub fusion: Option<FusionMetadata>,
    pub duplicate_group: Option<String>,
}

/// The persisted, user-facing unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: Option<i64>,
    pub symbol: String,
    pub direction: Direction,
    pub strength: SignalStrength,
    pub confidence_score: f64,
    pub confidence_level: ConfidenceLevel,
    pub entry_price: Decimal,
    pub target_price: Decimal,
    pub stop_loss: Decimal,
    pub risk_reward_ratio: f64,
    pub factor_scores: BTreeMap<String, f64>,
    pub quality_score: f64,
    pub is_valid: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_executed: bool,
    pub executed_at: Option<DateTime<Utc>>,
    pub execution_price: Option<Decimal>,
    pub is_profitable: Option<bool>,
    pub profit_loss: Option<f64>,
    pub metadata: SignalMetadata,
}

impl Signal {
    /// Build the record published for a selected candidate.
    pub fn from_scored(
        scored: &ScoredSignal,
        cycle_id: &str,
        created_at: DateTime<Utc>,
        ttl_hours: i64,
    ) -> Self {
        let fused = &scored.fused;
        let c = &fused.candidate;
        let confidence_score = fused.fused_confidence.clamp(0.0, 1.0);

        Self {
            id: None,
            symbol: c.symbol.clone(),
            direction: c.direction,
            strength: SignalStrength::from_score(fused.fused_strength),
            confidence_score,
            confidence_level: ConfidenceLevel::from_score(confidence_score),
            entry_price: c.entry_price,
            target_price: c.target_price,
            stop_loss: c.stop_loss,
            risk_reward_ratio: c.risk_reward_ratio,
            factor_scores: c.factor_scores.clone(),
            quality_score: scored.quality_score.clamp(0.0, 1.0),
            is_valid: true,
            created_at,
            expires_at: created_at + Duration::hours(ttl_hours),
            is_executed: false,
            executed_at: None,
            execution_price: None,
            is_profitable: None,
            profit_loss: None,
            metadata: SignalMetadata {
                cycle_id: Some(cycle_id.to_string()),
                strategy_id: Some(c.strategy_id.clone()),
                composite_score: Some(scored.composite_score),
                position_size_multiplier: Some(fused.position_size_multiplier),
                fusion: Some(fused.metadata.clone()),
                duplicate_group: None,
            },
        }
    }

    pub fn state_at(&self, now: DateTime<Utc>) -> SignalState {
        if self.id.is_none() {
            SignalState::Created
        } else if self.is_executed {
            SignalState::Executed
        } else if !self.is_valid || now > self.expires_at {
            SignalState::Expired
        } else {
            SignalState::Active
        }
    }

    pub fn calendar_date(&self) -> NaiveDate {
        self.created_at.date_naive()
    }
}

/// Why a record left the active set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArchiveReason {
    Rotation,
    Duplicate,
    Manual,
}

impl ArchiveReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveReason::Rotation => "ROTATION",
            ArchiveReason::Duplicate => "DUPLICATE",
            ArchiveReason::Manual => "MANUAL",
        }
    }
}

impl FromStr for ArchiveReason {
    type Err = SignalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ROTATION" => Ok(ArchiveReason::Rotation),
            "DUPLICATE" => Ok(ArchiveReason::Duplicate),
            "MANUAL" => Ok(ArchiveReason::Manual),
            other => Err(SignalError::Validation(format!(
                "unknown archive reason '{}'",
                other
            ))),
        }
    }
}

/// Immutable copy of a signal written before it leaves the active set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedSignal {
    pub history_id: i64,
    pub signal: Signal,
    pub archived_reason: ArchiveReason,
    pub archived_at: DateTime<Utc>,
}

/// One daily OHLCV bar from the historical-data store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyBar {
    pub symbol: String,
    pub date: NaiveDate,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    TargetHit,
    StopLossHit,
    EndOfDay,
    NotExecuted,
    Error,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::TargetHit => "TARGET_HIT",
            ExecutionStatus::StopLossHit => "STOP_LOSS_HIT",
            ExecutionStatus::EndOfDay => "END_OF_DAY",
            ExecutionStatus::NotExecuted => "NOT_EXECUTED",
            ExecutionStatus::Error => "ERROR",
        }
    }

    /// Whether the replay crossed a resting order (target or stop).
    pub fn is_execution(&self) -> bool {
        matches!(self, ExecutionStatus::TargetHit | ExecutionStatus::StopLossHit)
    }
}

impl FromStr for ExecutionStatus {
    type Err = SignalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TARGET_HIT" => Ok(ExecutionStatus::TargetHit),
            "STOP_LOSS_HIT" => Ok(ExecutionStatus::StopLossHit),
            "END_OF_DAY" => Ok(ExecutionStatus::EndOfDay),
            "NOT_EXECUTED" => Ok(ExecutionStatus::NotExecuted),
            "ERROR" => Ok(ExecutionStatus::Error),
            other => Err(SignalError::Validation(format!(
                "unknown execution status '{}'",
                other
            ))),
        }
    }
}

/// Result of replaying one signal against its issue-date bar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestOutcome {
    pub symbol: String,
    pub signal_id: Option<i64>,
    pub status: ExecutionStatus,
    pub execution_price: Option<Decimal>,
    pub execution_time: Option<DateTime<Utc>>,
    /// Percent of entry, e.g. 20.0 for a +20% move
    pub pnl_percent: Option<f64>,
    pub error: Option<String>,
}

impl BacktestOutcome {
    pub fn not_executed(signal: &Signal) -> Self {
        Self {
            symbol: signal.symbol.clone(),
            signal_id: signal.id,
            status: ExecutionStatus::NotExecuted,
            execution_price: None,
            execution_time: None,
            pnl_percent: None,
            error: None,
        }
    }

    pub fn error(signal: &Signal, message: impl Into<String>) -> Self {
        Self {
            symbol: signal.symbol.clone(),
            signal_id: signal.id,
            status: ExecutionStatus::Error,
            execution_price: None,
            execution_time: None,
            pnl_percent: None,
            error: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn candidate(direction: Direction, entry: Decimal, target: Decimal, stop: Decimal) -> Candidate {
        Candidate {
            symbol: "AAPL".to_string(),
            direction,
            strategy_id: "momentum".to_string(),
            confidence: 0.7,
            entry_price: entry,
            target_price: target,
            stop_loss: stop,
            risk_reward_ratio: 2.0,
            factor_scores: BTreeMap::new(),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 14, 0, 0).unwrap(),
            data_age_secs: None,
        }
    }

    #[test]
    fn test_buy_side_validation() {
        assert!(candidate(Direction::Buy, dec!(100), dec!(120), dec!(90)).validate().is_ok());
        assert!(candidate(Direction::Buy, dec!(100), dec!(95), dec!(90)).validate().is_err());
        assert!(candidate(Direction::Buy, dec!(100), dec!(120), dec!(105)).validate().is_err());
    }

    #[test]
    fn test_sell_side_validation() {
        assert!(candidate(Direction::Sell, dec!(100), dec!(80), dec!(110)).validate().is_ok());
        assert!(candidate(Direction::Sell, dec!(100), dec!(120), dec!(110)).validate().is_err());
    }

    #[test]
    fn test_hold_and_bad_entry_rejected() {
        assert!(candidate(Direction::Hold, dec!(100), dec!(120), dec!(90)).validate().is_err());
        assert!(candidate(Direction::Buy, dec!(0), dec!(120), dec!(-1)).validate().is_err());
    }

    #[test]
    fn test_non_positive_target_or_stop_rejected() {
        assert!(candidate(Direction::Buy, dec!(100), dec!(110), dec!(-5)).validate().is_err());
        assert!(candidate(Direction::Buy, dec!(100), dec!(110), dec!(0)).validate().is_err());
        assert!(candidate(Direction::Sell, dec!(100), dec!(0), dec!(110)).validate().is_err());
        assert!(candidate(Direction::Sell, dec!(100), dec!(-20), dec!(110)).validate().is_err());
    }

    #[test]
    fn test_nan_confidence_is_not_a_validation_error() {
        let mut c = candidate(Direction::Buy, dec!(100), dec!(120), dec!(90));
        c.confidence = f64::NAN;
        assert!(c.validate().is_ok());
        c.confidence = 1.4;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_direction_parsing() {
        assert_eq!("strong_buy".parse::<Direction>().unwrap(), Direction::Buy);
        assert_eq!("STRONG-SELL".parse::<Direction>().unwrap(), Direction::Sell);
        assert_eq!("Hold".parse::<Direction>().unwrap(), Direction::Hold);
        assert!("moon".parse::<Direction>().is_err());
    }

    #[test]
    fn test_prediction_well_formed() {
        let mut probabilities = BTreeMap::new();
        probabilities.insert(Direction::Buy, 0.7);
        probabilities.insert(Direction::Sell, 0.2);
        probabilities.insert(Direction::Hold, 0.1);
        let mut p = MlPrediction {
            symbol: "AAPL".to_string(),
            predicted_direction: Direction::Buy,
            confidence: 0.7,
            probabilities,
            timestamp: Utc::now(),
        };
        assert!(p.is_well_formed(0.01));
        p.probabilities.insert(Direction::Hold, 0.4);
        assert!(!p.is_well_formed(0.01));
    }

    #[test]
    fn test_state_transitions() {
        assert!(SignalState::Created.can_transition_to(SignalState::Active));
        assert!(SignalState::Active.can_transition_to(SignalState::Executed));
        assert!(SignalState::Executed.can_transition_to(SignalState::Archived));
        assert!(SignalState::Executed.transition(SignalState::Expired).is_err());
        assert!(SignalState::Archived.transition(SignalState::Active).is_err());
    }

    #[test]
    fn test_bands() {
        assert_eq!(SignalStrength::from_score(0.85), SignalStrength::VeryStrong);
        assert_eq!(SignalStrength::from_score(0.6), SignalStrength::Strong);
        assert_eq!(SignalStrength::from_score(0.1), SignalStrength::Weak);
        assert_eq!(ConfidenceLevel::from_score(0.45), ConfidenceLevel::Medium);
    }
}
