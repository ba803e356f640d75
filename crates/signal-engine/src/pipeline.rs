use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use signal_core::{
    Candidate, CandidateProvider, EngineConfig, MlPrediction, PredictionProvider, RejectReason,
    ScoredSignal, SignalError, SignalResult,
};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::fusion::FusionEngine;
use crate::quality::QualityFilter;
use crate::scorer::CompositeScorer;
use crate::selector::TopKSelector;

/// Why a single candidate did not make it to scoring
#[derive(Debug)]
pub enum Rejection {
    Invalid(SignalError),
    Filtered(RejectReason),
}

/// Fusion + quality filter + composite score for one candidate. Stateless.
pub struct Evaluator {
    fusion: FusionEngine,
    filter: QualityFilter,
    scorer: CompositeScorer,
}

impl Evaluator {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            fusion: FusionEngine::new(config.clone()),
            filter: QualityFilter::new(config.clone()),
            scorer: CompositeScorer::new(config.composite),
        }
    }

    pub fn evaluate(
        &self,
        candidate: Candidate,
        prediction: Option<MlPrediction>,
        now: DateTime<Utc>,
    ) -> Result<ScoredSignal, Rejection> {
        candidate.validate().map_err(Rejection::Invalid)?;
        let fused = self.fusion.fuse(candidate, prediction);
        let quality = self.filter.evaluate(&fused, now).map_err(Rejection::Filtered)?;
        Ok(self.scorer.score_fused(fused, quality))
    }
}

/// Per-symbol result, produced by one worker.
#[derive(Debug, Default)]
pub struct SymbolEvaluation {
    pub symbol: String,
    pub candidates_seen: usize,
    pub accepted: Vec<ScoredSignal>,
    pub rejected: Vec<RejectReason>,
    pub invalid: usize,
    pub provider_timeouts: usize,
    pub provider_errors: usize,
}

/// Counters for one generation cycle
#[derive(Debug, Clone, Default)]
pub struct CycleStats {
    pub symbols: usize,
    pub candidates_seen: usize,
    pub invalid: usize,
    pub provider_timeouts: usize,
    pub provider_errors: usize,
    pub worker_failures: usize,
    pub rejected: BTreeMap<RejectReason, usize>,
    pub accepted: usize,
    pub selected: usize,
}

impl CycleStats {
    fn absorb(&mut self, eval: &SymbolEvaluation) {
        self.candidates_seen += eval.candidates_seen;
        self.invalid += eval.invalid;
        self.provider_timeouts += eval.provider_timeouts;
        self.provider_errors += eval.provider_errors;
        self.accepted += eval.accepted.len();
        for reason in &eval.rejected {
            *self.rejected.entry(*reason).or_insert(0) += 1;
        }
    }

    pub fn total_rejected(&self) -> usize {
        self.rejected.values().sum()
    }
}

/// Output of the fan-in selection stage
#[derive(Debug)]
pub struct CycleSelection {
    pub cycle_id: String,
    pub evaluated_at: DateTime<Utc>,
    pub selected: Vec<ScoredSignal>,
    pub stats: CycleStats,
}

struct WorkerContext {
    evaluator: Evaluator,
    candidates: Arc<dyn CandidateProvider>,
    predictions: Arc<dyn PredictionProvider>,
    provider_timeout: Duration,
    prediction_window_secs: i64,
}

/// Parallel per-symbol evaluation with a single sequential selection stage.
pub struct SignalPipeline {
    ctx: Arc<WorkerContext>,
    selector: TopKSelector,
    semaphore: Arc<Semaphore>,
}

impl SignalPipeline {
    pub fn new(
        config: &EngineConfig,
        candidates: Arc<dyn CandidateProvider>,
        predictions: Arc<dyn PredictionProvider>,
        worker_pool_size: usize,
        provider_timeout: Duration,
    ) -> Self {
        Self {
            ctx: Arc::new(WorkerContext {
                evaluator: Evaluator::new(config),
                candidates,
                predictions,
                provider_timeout,
                prediction_window_secs: config.prediction_window_secs,
            }),
            selector: TopKSelector::new(config.top_k),
            semaphore: Arc::new(Semaphore::new(worker_pool_size.max(1))),
        }
    }

    /// Evaluate every symbol concurrently, then select the cycle's top-K.
    ///
    /// Per-symbol failures are isolated and counted. A shutdown signal aborts
    /// the whole cycle with `SignalError::Cancelled` before anything is selected.
    pub async fn run(
        &self,
        symbols: &[String],
        shutdown: &watch::Receiver<bool>,
        now: DateTime<Utc>,
    ) -> SignalResult<CycleSelection> {
        let mut shutdown = shutdown.clone();
        if *shutdown.borrow() {
            return Err(SignalError::Cancelled);
        }

        let cycle_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(
            "Cycle {}: evaluating {} symbols",
            cycle_id,
            symbols.len()
        );

        let mut tasks = JoinSet::new();
        for (index, symbol) in symbols.iter().enumerate() {
            let sem = Arc::clone(&self.semaphore);
            let ctx = Arc::clone(&self.ctx);
            let symbol = symbol.clone();
            tasks.spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                (index, evaluate_symbol(&ctx, symbol, now).await)
            });
        }

        let mut stats = CycleStats {
            symbols: symbols.len(),
            ..CycleStats::default()
        };
        let mut evaluations: Vec<(usize, SymbolEvaluation)> = Vec::with_capacity(symbols.len());
        let mut watching = true;

        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok(result)) => evaluations.push(result),
                    Some(Err(e)) => {
                        tracing::error!("Symbol worker failed: {}", e);
                        stats.worker_failures += 1;
                    }
                },
                changed = shutdown.changed(), if watching => {
                    if changed.is_err() {
                        // Sender gone: nobody can cancel this cycle anymore.
                        watching = false;
                    } else if *shutdown.borrow() {
                        tasks.abort_all();
                        tracing::warn!("Cycle {} cancelled during evaluation", cycle_id);
                        return Err(SignalError::Cancelled);
                    }
                }
            }
        }

        // Restore symbol order so selection never depends on completion order.
        evaluations.sort_by_key(|(index, _)| *index);

        let mut accepted = Vec::new();
        for (_, eval) in evaluations {
            stats.absorb(&eval);
            accepted.extend(eval.accepted);
        }

        let selected = self.selector.select(accepted);
        stats.selected = selected.len();

        tracing::info!(
            "Cycle {}: {} candidates, {} invalid, {} rejected, {} accepted, {} selected",
            cycle_id,
            stats.candidates_seen,
            stats.invalid,
            stats.total_rejected(),
            stats.accepted,
            stats.selected
        );

        Ok(CycleSelection {
            cycle_id,
            evaluated_at: now,
            selected,
            stats,
        })
    }
}

async fn evaluate_symbol(ctx: &WorkerContext, symbol: String, now: DateTime<Utc>) -> SymbolEvaluation {
    let mut eval = SymbolEvaluation {
        symbol: symbol.clone(),
        ..SymbolEvaluation::default()
    };

    let candidates =
        match tokio::time::timeout(ctx.provider_timeout, ctx.candidates.candidates(&symbol)).await {
            Ok(Ok(candidates)) => candidates,
            Ok(Err(e)) => {
                tracing::warn!("Candidate provider failed for {}: {}", symbol, e);
                eval.provider_errors += 1;
                return eval;
            }
            Err(_) => {
                tracing::warn!(
                    "Candidate provider timed out for {} after {:?}",
                    symbol,
                    ctx.provider_timeout
                );
                eval.provider_timeouts += 1;
                return eval;
            }
        };

    for candidate in candidates {
        eval.candidates_seen += 1;

        if let Err(e) = candidate.validate() {
            tracing::debug!("Dropping invalid candidate: {}", e);
            eval.invalid += 1;
            continue;
        }

        let prediction = match tokio::time::timeout(
            ctx.provider_timeout,
            ctx.predictions.prediction(&candidate),
        )
        .await
        {
            Ok(Ok(p)) => p.filter(|p| p.pairs_with(&candidate, ctx.prediction_window_secs)),
            Ok(Err(e)) => {
                tracing::debug!("Prediction unavailable for {} ({}), using rule only", symbol, e);
                eval.provider_errors += 1;
                None
            }
            Err(_) => {
                tracing::debug!("Prediction timed out for {}, using rule only", symbol);
                eval.provider_timeouts += 1;
                None
            }
        };

        let strategy = candidate.strategy_id.clone();
        match ctx.evaluator.evaluate(candidate, prediction, now) {
            Ok(scored) => eval.accepted.push(scored),
            Err(Rejection::Filtered(reason)) => {
                tracing::debug!("Rejected {} ({}): {}", symbol, strategy, reason);
                eval.rejected.push(reason);
            }
            Err(Rejection::Invalid(e)) => {
                tracing::debug!("Dropping invalid candidate: {}", e);
                eval.invalid += 1;
            }
        }
    }

    eval
}
