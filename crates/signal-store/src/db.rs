use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use signal_core::{
    ArchiveReason, ArchivedSignal, ConfidenceLevel, Direction, Signal, SignalError,
    SignalMetadata, SignalResult, SignalStrength,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use tokio::sync::{Mutex, MutexGuard};

/// Columns shared by `active_signals` and `signal_history`, in insert order.
pub(crate) const SIGNAL_COLUMNS: &str = "symbol, direction, strength, confidence_score, \
    confidence_level, entry_price, target_price, stop_loss, risk_reward_ratio, factor_scores, \
    quality_score, is_valid, created_at, expires_at, is_executed, executed_at, execution_price, \
    is_profitable, profit_loss, cycle_id, metadata";

/// SQLite-backed signal store.
///
/// Cloning is cheap; clones share the pool and the cycle lock.
#[derive(Clone)]
pub struct SignalStore {
    pool: SqlitePool,
    cycle_lock: Arc<Mutex<()>>,
}

impl SignalStore {
    /// Open (or create) the database and apply the schema.
    pub async fn connect(database_url: &str) -> SignalResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(SignalError::persistence)?
            .create_if_missing(true);

        // Every in-memory connection is its own database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(SignalError::persistence)?;

        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> SignalResult<Self> {
        let store = Self {
            pool,
            cycle_lock: Arc::new(Mutex::new(())),
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> SignalResult<()> {
        let schema = include_str!("../schema.sql");

        // sqlx runs one statement per query
        for statement in schema.split(';') {
            let stmt = statement.trim();
            if !stmt.is_empty() {
                sqlx::query(stmt)
                    .execute(&self.pool)
                    .await
                    .map_err(SignalError::persistence)?;
            }
        }

        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Serializes every writer of the signal set within this process.
    pub(crate) async fn lock_cycle(&self) -> MutexGuard<'_, ()> {
        self.cycle_lock.lock().await
    }

    /// Read-only view of the current active set, ordered by id.
    pub async fn active_snapshot(&self) -> SignalResult<Vec<Signal>> {
        let rows = sqlx::query_as::<_, SignalRow>(&format!(
            "SELECT id, {} FROM active_signals ORDER BY id",
            SIGNAL_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(SignalError::persistence)?;

        rows.into_iter().map(SignalRow::into_signal).collect()
    }

    pub async fn active_signal(&self, id: i64) -> SignalResult<Option<Signal>> {
        let mut conn = self.pool.acquire().await.map_err(SignalError::persistence)?;
        fetch_active(&mut conn, id).await
    }

    pub async fn active_count(&self) -> SignalResult<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM active_signals")
            .fetch_one(&self.pool)
            .await
            .map_err(SignalError::persistence)?;
        Ok(count)
    }

    /// Most recent archive entries first.
    pub async fn history(&self, limit: i64) -> SignalResult<Vec<ArchivedSignal>> {
        let rows = sqlx::query_as::<_, HistoryRow>(&format!(
            "SELECT history_id, signal_id AS id, {}, archived_reason, archived_at
             FROM signal_history ORDER BY history_id DESC LIMIT ?",
            SIGNAL_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(SignalError::persistence)?;

        rows.into_iter().map(HistoryRow::into_archived).collect()
    }

    pub async fn history_by_reason(&self, reason: ArchiveReason) -> SignalResult<Vec<ArchivedSignal>> {
        let rows = sqlx::query_as::<_, HistoryRow>(&format!(
            "SELECT history_id, signal_id AS id, {}, archived_reason, archived_at
             FROM signal_history WHERE archived_reason = ? ORDER BY history_id",
            SIGNAL_COLUMNS
        ))
        .bind(reason.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(SignalError::persistence)?;

        rows.into_iter().map(HistoryRow::into_archived).collect()
    }
}

pub(crate) async fn fetch_active(conn: &mut SqliteConnection, id: i64) -> SignalResult<Option<Signal>> {
    let row = sqlx::query_as::<_, SignalRow>(&format!(
        "SELECT id, {} FROM active_signals WHERE id = ?",
        SIGNAL_COLUMNS
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(SignalError::persistence)?;

    row.map(SignalRow::into_signal).transpose()
}

/// Insert one signal into the active set and return its id.
pub(crate) async fn insert_active(conn: &mut SqliteConnection, signal: &Signal) -> SignalResult<i64> {
    let factor_scores = serde_json::to_string(&signal.factor_scores).map_err(SignalError::persistence)?;
    let metadata = serde_json::to_string(&signal.metadata).map_err(SignalError::persistence)?;

    let result = sqlx::query(&format!(
        "INSERT INTO active_signals ({}) VALUES \
         (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        SIGNAL_COLUMNS
    ))
    .bind(&signal.symbol)
    .bind(signal.direction.as_str())
    .bind(signal.strength.as_str())
    .bind(signal.confidence_score)
    .bind(signal.confidence_level.as_str())
    .bind(signal.entry_price.to_string())
    .bind(signal.target_price.to_string())
    .bind(signal.stop_loss.to_string())
    .bind(signal.risk_reward_ratio)
    .bind(factor_scores)
    .bind(signal.quality_score)
    .bind(signal.is_valid)
    .bind(format_ts(signal.created_at))
    .bind(format_ts(signal.expires_at))
    .bind(signal.is_executed)
    .bind(signal.executed_at.map(format_ts))
    .bind(signal.execution_price.map(|p| p.to_string()))
    .bind(signal.is_profitable)
    .bind(signal.profit_loss)
    .bind(signal.metadata.cycle_id.as_deref())
    .bind(metadata)
    .execute(&mut *conn)
    .await
    .map_err(SignalError::persistence)?;

    Ok(result.last_insert_rowid())
}

/// Copy active rows into history, then delete them. `ids = None` moves the whole set.
///
/// Callers run this inside a transaction.
pub(crate) async fn archive_active(
    conn: &mut SqliteConnection,
    ids: Option<&[i64]>,
    reason: ArchiveReason,
    archived_at: DateTime<Utc>,
) -> SignalResult<u64> {
    let copy = format!(
        "INSERT INTO signal_history (signal_id, {cols}, archived_reason, archived_at)
         SELECT id, {cols}, ?, ? FROM active_signals",
        cols = SIGNAL_COLUMNS
    );
    let archived_at = format_ts(archived_at);

    match ids {
        None => {
            sqlx::query(&format!("{} ORDER BY id", copy))
                .bind(reason.as_str())
                .bind(&archived_at)
                .execute(&mut *conn)
                .await
                .map_err(SignalError::persistence)?;
            let deleted = sqlx::query("DELETE FROM active_signals")
                .execute(&mut *conn)
                .await
                .map_err(SignalError::persistence)?;
            Ok(deleted.rows_affected())
        }
        Some(ids) => {
            let copy_one = format!("{} WHERE id = ?", copy);
            let mut moved = 0;
            for id in ids {
                sqlx::query(&copy_one)
                    .bind(reason.as_str())
                    .bind(&archived_at)
                    .bind(*id)
                    .execute(&mut *conn)
                    .await
                    .map_err(SignalError::persistence)?;
                let deleted = sqlx::query("DELETE FROM active_signals WHERE id = ?")
                    .bind(*id)
                    .execute(&mut *conn)
                    .await
                    .map_err(SignalError::persistence)?;
                moved += deleted.rows_affected();
            }
            Ok(moved)
        }
    }
}

/// Fixed-width UTC text so that string comparison in SQL orders correctly.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(raw: &str) -> SignalResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| SignalError::Persistence(format!("bad timestamp '{}': {}", raw, e)))
}

pub fn parse_decimal(raw: &str) -> SignalResult<Decimal> {
    Decimal::from_str(raw)
        .map_err(|e| SignalError::Persistence(format!("bad decimal '{}': {}", raw, e)))
}

/// Internal row type for sqlx deserialization.
#[derive(sqlx::FromRow)]
pub(crate) struct SignalRow {
    id: i64,
    symbol: String,
    direction: String,
    strength: String,
    confidence_score: f64,
    confidence_level: String,
    entry_price: String,
    target_price: String,
    stop_loss: String,
    risk_reward_ratio: f64,
    factor_scores: String,
    quality_score: f64,
    is_valid: bool,
    created_at: String,
    expires_at: String,
    is_executed: bool,
    executed_at: Option<String>,
    execution_price: Option<String>,
    is_profitable: Option<bool>,
    profit_loss: Option<f64>,
    #[allow(dead_code)]
    cycle_id: Option<String>,
    metadata: String,
}

impl SignalRow {
    pub(crate) fn into_signal(self) -> SignalResult<Signal> {
        let id = self.id;
        let corrupt = |what: &str, e: &dyn std::fmt::Display| {
            SignalError::Persistence(format!("signal {}: bad {}: {}", id, what, e))
        };

        let factor_scores: BTreeMap<String, f64> =
            serde_json::from_str(&self.factor_scores).map_err(|e| corrupt("factor_scores", &e))?;
        let metadata: SignalMetadata =
            serde_json::from_str(&self.metadata).map_err(|e| corrupt("metadata", &e))?;

        Ok(Signal {
            id: Some(id),
            direction: Direction::from_str(&self.direction)?,
            strength: SignalStrength::from_str(&self.strength)?,
            confidence_score: self.confidence_score,
            confidence_level: ConfidenceLevel::from_str(&self.confidence_level)?,
            entry_price: parse_decimal(&self.entry_price)?,
            target_price: parse_decimal(&self.target_price)?,
            stop_loss: parse_decimal(&self.stop_loss)?,
            risk_reward_ratio: self.risk_reward_ratio,
            factor_scores,
            quality_score: self.quality_score,
            is_valid: self.is_valid,
            created_at: parse_ts(&self.created_at)?,
            expires_at: parse_ts(&self.expires_at)?,
            is_executed: self.is_executed,
            executed_at: self.executed_at.as_deref().map(parse_ts).transpose()?,
            execution_price: self.execution_price.as_deref().map(parse_decimal).transpose()?,
            is_profitable: self.is_profitable,
            profit_loss: self.profit_loss,
            metadata,
            symbol: self.symbol,
        })
    }
}

#[derive(sqlx::FromRow)]
struct HistoryRow {
    history_id: i64,
    #[sqlx(flatten)]
    signal: SignalRow,
    archived_reason: String,
    archived_at: String,
}

impl HistoryRow {
    fn into_archived(self) -> SignalResult<ArchivedSignal> {
        Ok(ArchivedSignal {
            history_id: self.history_id,
            archived_reason: ArchiveReason::from_str(&self.archived_reason)?,
            archived_at: parse_ts(&self.archived_at)?,
            signal: self.signal.into_signal()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_db_creation() {
        let store = SignalStore::connect("sqlite::memory:").await.unwrap();
        assert!(store.pool().acquire().await.is_ok());
        assert_eq!(store.active_count().await.unwrap(), 0);
        assert!(store.history(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_schema_is_reentrant() {
        let store = SignalStore::connect("sqlite::memory:").await.unwrap();
        store.init_schema().await.unwrap();
    }

    #[test]
    fn test_timestamps_sort_lexically() {
        let a = Utc.with_ymd_and_hms(2024, 1, 9, 23, 59, 59).unwrap();
        let b = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();
        assert!(format_ts(a) < format_ts(b));
        assert_eq!(parse_ts(&format_ts(a)).unwrap(), a);
    }

    #[test]
    fn test_decimal_text_is_exact() {
        let price = parse_decimal("101.2500").unwrap();
        assert_eq!(price.to_string(), "101.2500");
        assert!(parse_decimal("abc").is_err());
    }
}
