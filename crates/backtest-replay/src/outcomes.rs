use std::collections::HashSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use signal_core::{BacktestOutcome, ExecutionStatus, SignalError, SignalResult};
use signal_store::db::{format_ts, parse_decimal, parse_ts};
use sqlx::sqlite::{SqliteConnection, SqlitePool};

/// Append-only log of verification results (`backtest_outcomes`).
#[derive(Clone)]
pub struct OutcomeLog {
    pool: SqlitePool,
}

impl OutcomeLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append on a caller-owned connection, typically inside its transaction.
    pub async fn append_in(
        conn: &mut SqliteConnection,
        outcomes: &[BacktestOutcome],
        verified_at: DateTime<Utc>,
    ) -> SignalResult<()> {
        let verified_at = format_ts(verified_at);

        for outcome in outcomes {
            sqlx::query(
                "INSERT INTO backtest_outcomes (
                    signal_id, symbol, status, execution_price, execution_time,
                    pnl_percent, error, verified_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(outcome.signal_id)
            .bind(&outcome.symbol)
            .bind(outcome.status.as_str())
            .bind(outcome.execution_price.map(|p| p.to_string()))
            .bind(outcome.execution_time.map(format_ts))
            .bind(outcome.pnl_percent)
            .bind(outcome.error.as_deref())
            .bind(&verified_at)
            .execute(&mut *conn)
            .await
            .map_err(SignalError::persistence)?;
        }

        Ok(())
    }

    /// Signals that already have a verdict. ERROR rows do not count, those
    /// signals are verified again.
    pub async fn verified_signal_ids(&self) -> SignalResult<HashSet<i64>> {
        let ids: Vec<(i64,)> = sqlx::query_as(
            "SELECT DISTINCT signal_id FROM backtest_outcomes
             WHERE signal_id IS NOT NULL AND status != 'ERROR'",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(SignalError::persistence)?;

        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    /// Every verification of one signal, oldest first.
    pub async fn for_signal(&self, signal_id: i64) -> SignalResult<Vec<BacktestOutcome>> {
        let rows: Vec<OutcomeRow> = sqlx::query_as(
            "SELECT signal_id, symbol, status, execution_price, execution_time, pnl_percent, error
             FROM backtest_outcomes WHERE signal_id = ? ORDER BY id",
        )
        .bind(signal_id)
        .fetch_all(&self.pool)
        .await
        .map_err(SignalError::persistence)?;

        rows.into_iter().map(OutcomeRow::into_outcome).collect()
    }

    pub async fn recent(&self, limit: i64) -> SignalResult<Vec<BacktestOutcome>> {
        let rows: Vec<OutcomeRow> = sqlx::query_as(
            "SELECT signal_id, symbol, status, execution_price, execution_time, pnl_percent, error
             FROM backtest_outcomes ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(SignalError::persistence)?;

        rows.into_iter().map(OutcomeRow::into_outcome).collect()
    }
}

#[derive(sqlx::FromRow)]
struct OutcomeRow {
    signal_id: Option<i64>,
    symbol: String,
    status: String,
    execution_price: Option<String>,
    execution_time: Option<String>,
    pnl_percent: Option<f64>,
    error: Option<String>,
}

impl OutcomeRow {
    fn into_outcome(self) -> SignalResult<BacktestOutcome> {
        Ok(BacktestOutcome {
            signal_id: self.signal_id,
            status: ExecutionStatus::from_str(&self.status)?,
            execution_price: self.execution_price.as_deref().map(parse_decimal).transpose()?,
            execution_time: self.execution_time.as_deref().map(parse_ts).transpose()?,
            pnl_percent: self.pnl_percent,
            error: self.error,
            symbol: self.symbol,
        })
    }
}
