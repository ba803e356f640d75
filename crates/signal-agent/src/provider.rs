use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use signal_core::{
    Candidate, CandidateProvider, DailyBar, Direction, MlPrediction, PredictionProvider,
    SignalResult,
};

/// Candidate as written by the strategy services. Directions use their own
/// spellings (`STRONG_BUY`, `sell`, ...).
#[derive(Debug, Deserialize)]
struct RawCandidate {
    symbol: String,
    direction: String,
    #[serde(default = "default_strategy")]
    strategy_id: String,
    /// Missing confidence is neutral, handled downstream
    #[serde(default)]
    confidence: Option<f64>,
    entry_price: Decimal,
    target_price: Decimal,
    stop_loss: Decimal,
    risk_reward_ratio: f64,
    #[serde(default)]
    factor_scores: BTreeMap<String, f64>,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    data_age_secs: Option<i64>,
}

fn default_strategy() -> String {
    "unknown".to_string()
}

impl RawCandidate {
    fn into_candidate(self) -> SignalResult<Candidate> {
        Ok(Candidate {
            direction: Direction::from_str(&self.direction)?,
            symbol: self.symbol.trim().to_uppercase(),
            strategy_id: self.strategy_id,
            confidence: self.confidence.unwrap_or(f64::NAN),
            entry_price: self.entry_price,
            target_price: self.target_price,
            stop_loss: self.stop_loss,
            risk_reward_ratio: self.risk_reward_ratio,
            factor_scores: self.factor_scores,
            timestamp: self.timestamp,
            data_age_secs: self.data_age_secs,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawPrediction {
    symbol: String,
    predicted_direction: String,
    confidence: f64,
    #[serde(default)]
    probabilities: BTreeMap<String, f64>,
    timestamp: DateTime<Utc>,
}

impl RawPrediction {
    fn into_prediction(self) -> SignalResult<MlPrediction> {
        let mut probabilities = BTreeMap::new();
        for (label, p) in self.probabilities {
            *probabilities.entry(Direction::from_str(&label)?).or_insert(0.0) += p;
        }
        Ok(MlPrediction {
            symbol: self.symbol.trim().to_uppercase(),
            predicted_direction: Direction::from_str(&self.predicted_direction)?,
            confidence: self.confidence,
            probabilities,
            timestamp: self.timestamp,
        })
    }
}

/// Candidate provider adapter over JSON exports of the strategy and ML services.
pub struct JsonFileProvider {
    candidates: HashMap<String, Vec<Candidate>>,
    /// Symbols in first-seen order
    symbols: Vec<String>,
    predictions: HashMap<String, Vec<MlPrediction>>,
}

impl JsonFileProvider {
    pub fn load(candidates_path: impl AsRef<Path>, predictions_path: Option<impl AsRef<Path>>) -> Result<Self> {
        let path = candidates_path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read candidates from {}", path.display()))?;
        let candidates: Vec<RawCandidate> = serde_json::from_str(&raw)
            .with_context(|| format!("Malformed candidates file {}", path.display()))?;

        let predictions: Vec<RawPrediction> = match predictions_path {
            Some(p) => {
                let p = p.as_ref();
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("Failed to read predictions from {}", p.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("Malformed predictions file {}", p.display()))?
            }
            None => Vec::new(),
        };

        Ok(Self::from_raw(candidates, predictions))
    }

    fn from_raw(candidates: Vec<RawCandidate>, predictions: Vec<RawPrediction>) -> Self {
        let candidates = candidates
            .into_iter()
            .filter_map(|raw| {
                let symbol = raw.symbol.clone();
                raw.into_candidate()
                    .map_err(|e| tracing::warn!("Skipping candidate for {}: {}", symbol, e))
                    .ok()
            })
            .collect();
        let predictions = predictions
            .into_iter()
            .filter_map(|raw| {
                let symbol = raw.symbol.clone();
                raw.into_prediction()
                    .map_err(|e| tracing::warn!("Skipping prediction for {}: {}", symbol, e))
                    .ok()
            })
            .collect();
        Self::new(candidates, predictions)
    }

    pub fn new(candidates: Vec<Candidate>, predictions: Vec<MlPrediction>) -> Self {
        let mut by_symbol: HashMap<String, Vec<Candidate>> = HashMap::new();
        let mut symbols = Vec::new();
        for c in candidates {
            if !by_symbol.contains_key(&c.symbol) {
                symbols.push(c.symbol.clone());
            }
            by_symbol.entry(c.symbol.clone()).or_default().push(c);
        }

        let mut by_prediction_symbol: HashMap<String, Vec<MlPrediction>> = HashMap::new();
        for p in predictions {
            by_prediction_symbol.entry(p.symbol.clone()).or_default().push(p);
        }

        tracing::info!(
            "Loaded {} candidates for {} symbols, {} predictions",
            by_symbol.values().map(Vec::len).sum::<usize>(),
            symbols.len(),
            by_prediction_symbol.values().map(Vec::len).sum::<usize>()
        );

        Self {
            candidates: by_symbol,
            symbols,
            predictions: by_prediction_symbol,
        }
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }
}

#[async_trait]
impl CandidateProvider for JsonFileProvider {
    async fn candidates(&self, symbol: &str) -> SignalResult<Vec<Candidate>> {
        Ok(self.candidates.get(symbol).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl PredictionProvider for JsonFileProvider {
    /// The prediction for the candidate's symbol closest in time.
    async fn prediction(&self, candidate: &Candidate) -> SignalResult<Option<MlPrediction>> {
        let nearest = self.predictions.get(&candidate.symbol).and_then(|list| {
            list.iter()
                .min_by_key(|p| (p.timestamp - candidate.timestamp).num_seconds().abs())
                .cloned()
        });
        Ok(nearest)
    }
}

/// Daily bars exported as a JSON array.
pub fn load_bars(path: impl AsRef<Path>) -> Result<Vec<DailyBar>> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read bars from {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Malformed bars file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CANDIDATES: &str = r#"[
        {"symbol": "aapl", "direction": "STRONG_BUY", "strategy_id": "momentum", "confidence": 0.8,
         "entry_price": 100, "target_price": 110, "stop_loss": 95, "risk_reward_ratio": 2.0,
         "factor_scores": {"news": 0.6}, "timestamp": "2024-06-03T14:00:00Z", "data_age_secs": 60},
        {"symbol": "MSFT", "direction": "sell", "entry_price": 400, "target_price": 380,
         "stop_loss": 410, "risk_reward_ratio": 2.0, "timestamp": "2024-06-03T14:00:00Z"},
        {"symbol": "TSLA", "direction": "SIDEWAYS", "entry_price": 180, "target_price": 190,
         "stop_loss": 175, "risk_reward_ratio": 2.0, "timestamp": "2024-06-03T14:00:00Z"}
    ]"#;

    const PREDICTIONS: &str = r#"[
        {"symbol": "AAPL", "predicted_direction": "BUY", "confidence": 0.7,
         "probabilities": {"BUY": 0.7, "SELL": 0.2, "HOLD": 0.1}, "timestamp": "2024-06-03T09:00:00Z"},
        {"symbol": "AAPL", "predicted_direction": "SELL", "confidence": 0.9,
         "probabilities": {"BUY": 0.1, "SELL": 0.9}, "timestamp": "2024-06-03T13:50:00Z"}
    ]"#;

    fn provider() -> JsonFileProvider {
        JsonFileProvider::from_raw(
            serde_json::from_str(CANDIDATES).unwrap(),
            serde_json::from_str(PREDICTIONS).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_normalizes_provider_spellings() {
        let provider = provider();
        assert_eq!(provider.symbols(), &["AAPL".to_string(), "MSFT".to_string()]);

        let aapl = provider.candidates("AAPL").await.unwrap();
        assert_eq!(aapl[0].direction, Direction::Buy);
        assert_eq!(aapl[0].factor("news"), 0.6);

        let msft = provider.candidates("MSFT").await.unwrap();
        assert_eq!(msft[0].direction, Direction::Sell);
        assert!(msft[0].confidence.is_nan());
        assert_eq!(msft[0].strategy_id, "unknown");

        assert!(provider.candidates("TSLA").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_picks_nearest_prediction() {
        let provider = provider();
        let aapl = provider.candidates("AAPL").await.unwrap();
        let prediction = provider.prediction(&aapl[0]).await.unwrap().unwrap();
        assert_eq!(prediction.predicted_direction, Direction::Sell);

        let msft = provider.candidates("MSFT").await.unwrap();
        assert!(provider.prediction(&msft[0]).await.unwrap().is_none());
    }
}
