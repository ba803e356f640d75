use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use backtest_replay::{BacktestVerifier, OutcomeLog, SqliteBarStore};
use chrono::Utc;
use signal_core::{NoPredictions, PredictionProvider};
use signal_engine::SignalPipeline;
use signal_store::{DedupScope, DuplicateRemover, LifecycleManager, SignalStore};
use tokio::sync::watch;

mod config;
mod cycle;
mod metrics;
mod provider;

use config::{AgentConfig, AgentMode};
use cycle::GenerationCycle;
use provider::JsonFileProvider;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load .env, init tracing
    dotenvy::dotenv().ok();

    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        tracing::error!("PANIC: {info}");
    }));

    // 2. Configuration
    let config = AgentConfig::from_env()?;
    tracing::info!("Starting signal agent in {:?} mode", config.mode);
    tracing::info!("  Top-K: {}", config.engine.top_k);
    tracing::info!("  Min confidence: {:.0}%", config.engine.min_confidence_threshold * 100.0);
    tracing::info!("  Min risk/reward: {:.2}", config.engine.min_risk_reward_ratio);
    tracing::info!("  Duplicate tolerance: {:.2}%", config.engine.tolerance_percentage * 100.0);
    tracing::info!(
        "  Workers: {} (provider timeout {}ms)",
        config.worker_pool_size,
        config.provider_timeout_ms
    );

    // 3. Storage
    let store = SignalStore::connect(&config.database_url)
        .await
        .with_context(|| format!("Failed to open signal store at {}", config.database_url))?;
    let lifecycle = LifecycleManager::new(store.clone());

    // 4. Shutdown on SIGINT / SIGTERM
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown().await;
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let now = Utc::now();
    match config.mode {
        AgentMode::Generate => {
            let provider = Arc::new(
                JsonFileProvider::load(&config.candidates_path, config.predictions_path.as_deref())
                    .context("Failed to load strategy candidates")?,
            );
            let predictions: Arc<dyn PredictionProvider> = if config.predictions_path.is_some() {
                provider.clone()
            } else {
                Arc::new(NoPredictions)
            };
            let symbols = if config.symbols.is_empty() {
                provider.symbols().to_vec()
            } else {
                config.symbols.clone()
            };

            let pipeline = SignalPipeline::new(
                &config.engine,
                provider,
                predictions,
                config.worker_pool_size,
                Duration::from_millis(config.provider_timeout_ms),
            );
            let remover = DuplicateRemover::new(store.clone(), config.engine.tolerance_percentage)?;
            let cycle = GenerationCycle::new(
                pipeline,
                lifecycle,
                remover,
                config.engine.signal_ttl_hours,
                symbols,
            );

            let metrics = cycle.run(&shutdown_rx, now).await?;
            metrics.log();
            tracing::info!("Cycle summary: {}", metrics.to_json());
        }

        AgentMode::Dedup => {
            let remover = DuplicateRemover::new(store.clone(), config.engine.tolerance_percentage)?;
            let report = match config.cleanup_days {
                Some(days) => remover.cleanup_old(days, config.dry_run, now).await?,
                None => remover.run(&DedupScope::All, config.dry_run, now).await?,
            };
            tracing::info!(
                "Duplicate sweep{}: scanned {}, {} groups, {} removed",
                if report.dry_run { " (dry run)" } else { "" },
                report.scanned,
                report.groups.len(),
                report.removed_ids.len()
            );
        }

        AgentMode::Verify => {
            let bars = SqliteBarStore::new(store.pool().clone());
            if let Some(path) = &config.bars_path {
                let loaded = provider::load_bars(path)?;
                let written = bars.upsert_many(&loaded).await?;
                tracing::info!("Loaded {} daily bars from {}", written, path);
            }

            let verifier = BacktestVerifier::new(
                Arc::new(bars),
                OutcomeLog::new(store.pool().clone()),
                lifecycle,
            );
            let active = store.active_snapshot().await?;
            let result = verifier.verify(&active, now).await?;
            let s = &result.summary;
            tracing::info!(
                total = s.total,
                target_hits = s.target_hits,
                stop_hits = s.stop_hits,
                end_of_day = s.end_of_day,
                not_executed = s.not_executed,
                errors = s.errors,
                win_rate = s.win_rate,
                avg_pnl_percent = s.avg_pnl_percent,
                marked_executed = result.marked_executed,
                skipped = result.skipped,
                "Backtest verification complete"
            );
        }

        AgentMode::Expire => {
            let expired = lifecycle.expire_stale(now).await?;
            tracing::info!("Expired {} stale signals", expired);
        }
    }

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("SIGTERM handler unavailable: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
