use std::env;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use signal_core::EngineConfig;

/// What one invocation of the agent does. Scheduling is external.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    /// Generation cycle followed by a duplicate sweep
    Generate,
    Dedup,
    Verify,
    Expire,
}

impl FromStr for AgentMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "generate" => Ok(AgentMode::Generate),
            "dedup" => Ok(AgentMode::Dedup),
            "verify" => Ok(AgentMode::Verify),
            "expire" => Ok(AgentMode::Expire),
            other => bail!("unknown AGENT_MODE '{}' (generate|dedup|verify|expire)", other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub mode: AgentMode,
    pub database_url: String,

    // Inputs
    pub candidates_path: String,
    pub predictions_path: Option<String>,
    pub bars_path: Option<String>,
    /// Empty means every symbol found in the candidates file
    pub symbols: Vec<String>,

    // Worker pool
    pub worker_pool_size: usize,
    pub provider_timeout_ms: u64,

    // Duplicate sweep
    pub cleanup_days: Option<i64>,
    pub dry_run: bool,

    pub engine: EngineConfig,
}

impl AgentConfig {
    /// Read `.env` and the process environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let defaults = EngineConfig::default();

        let default_workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .to_string();

        let mut engine = EngineConfig {
            top_k: var("TOP_K", &defaults.top_k.to_string())
                .parse()
                .context("TOP_K must be a positive integer")?,
            min_confidence_threshold: var("MIN_CONFIDENCE", &defaults.min_confidence_threshold.to_string())
                .parse()
                .context("MIN_CONFIDENCE must be a number")?,
            min_risk_reward_ratio: var("MIN_RISK_REWARD", &defaults.min_risk_reward_ratio.to_string())
                .parse()
                .context("MIN_RISK_REWARD must be a number")?,
            max_data_age_secs: var("MAX_DATA_AGE_SECS", &defaults.max_data_age_secs.to_string())
                .parse()
                .context("MAX_DATA_AGE_SECS must be an integer")?,
            tolerance_percentage: var("DUPLICATE_TOLERANCE", &defaults.tolerance_percentage.to_string())
                .parse()
                .context("DUPLICATE_TOLERANCE must be a number")?,
            signal_ttl_hours: var("SIGNAL_TTL_HOURS", &defaults.signal_ttl_hours.to_string())
                .parse()
                .context("SIGNAL_TTL_HOURS must be an integer")?,
            ..defaults
        };
        if lookup("TOP_K").is_none() && var("DEPLOYMENT", "").eq_ignore_ascii_case("extended") {
            engine.top_k = EngineConfig::extended().top_k;
        }
        engine.validate().context("invalid engine configuration")?;

        let config = Self {
            mode: var("AGENT_MODE", "generate").parse()?,
            database_url: var("DATABASE_URL", "sqlite:signals.db"),

            candidates_path: var("CANDIDATES_PATH", "candidates.json"),
            predictions_path: lookup("PREDICTIONS_PATH").filter(|p| !p.trim().is_empty()),
            bars_path: lookup("BARS_PATH").filter(|p| !p.trim().is_empty()),
            symbols: var("SYMBOLS", "")
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect(),

            worker_pool_size: var("WORKER_POOL_SIZE", &default_workers)
                .parse()
                .context("WORKER_POOL_SIZE must be a positive integer")?,
            provider_timeout_ms: var("PROVIDER_TIMEOUT_MS", "5000")
                .parse()
                .context("PROVIDER_TIMEOUT_MS must be an integer")?,

            cleanup_days: lookup("CLEANUP_DAYS")
                .map(|v| v.parse())
                .transpose()
                .context("CLEANUP_DAYS must be an integer")?,
            dry_run: var("DRY_RUN", "false")
                .parse()
                .context("DRY_RUN must be true or false")?,

            engine,
        };

        if config.worker_pool_size == 0 {
            bail!("WORKER_POOL_SIZE must be at least 1");
        }
        if config.provider_timeout_ms == 0 {
            bail!("PROVIDER_TIMEOUT_MS must be positive");
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<AgentConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AgentConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.mode, AgentMode::Generate);
        assert_eq!(config.engine.top_k, 5);
        assert_eq!(config.engine.signal_ttl_hours, 24);
        assert!(config.symbols.is_empty());
        assert!(config.worker_pool_size >= 1);
        assert!(!config.dry_run);
        assert!(config.cleanup_days.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("AGENT_MODE", "Dedup"),
            ("TOP_K", "10"),
            ("SYMBOLS", "aapl, msft,,nvda"),
            ("CLEANUP_DAYS", "30"),
            ("DRY_RUN", "true"),
            ("DUPLICATE_TOLERANCE", "0.02"),
        ])
        .unwrap();
        assert_eq!(config.mode, AgentMode::Dedup);
        assert_eq!(config.engine.top_k, 10);
        assert_eq!(config.symbols, vec!["AAPL", "MSFT", "NVDA"]);
        assert_eq!(config.cleanup_days, Some(30));
        assert!(config.dry_run);
        assert_eq!(config.engine.tolerance_percentage, 0.02);
    }

    #[test]
    fn test_extended_deployment() {
        assert_eq!(config(&[("DEPLOYMENT", "extended")]).unwrap().engine.top_k, 10);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(config(&[("TOP_K", "0")]).is_err());
        assert!(config(&[("TOP_K", "five")]).is_err());
        assert!(config(&[("AGENT_MODE", "trade")]).is_err());
        assert!(config(&[("DUPLICATE_TOLERANCE", "1.2")]).is_err());
        assert!(config(&[("WORKER_POOL_SIZE", "0")]).is_err());
    }
}
