use async_trait::async_trait;
use chrono::NaiveDate;
use signal_core::{BarStore, DailyBar, SignalError, SignalResult};
use signal_store::db::parse_decimal;
use sqlx::SqlitePool;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// `daily_bars` table, keyed by (symbol, date).
#[derive(Clone)]
pub struct SqliteBarStore {
    pool: SqlitePool,
}

impl SqliteBarStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace one bar.
    pub async fn upsert(&self, bar: &DailyBar) -> SignalResult<()> {
        sqlx::query(
            "INSERT INTO daily_bars (symbol, bar_date, open, high, low, close, volume)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(symbol, bar_date) DO UPDATE SET
                open = excluded.open, high = excluded.high, low = excluded.low,
                close = excluded.close, volume = excluded.volume",
        )
        .bind(&bar.symbol)
        .bind(bar.date.format(DATE_FORMAT).to_string())
        .bind(bar.open.to_string())
        .bind(bar.high.to_string())
        .bind(bar.low.to_string())
        .bind(bar.close.to_string())
        .bind(bar.volume)
        .execute(&self.pool)
        .await
        .map_err(SignalError::persistence)?;
        Ok(())
    }

    pub async fn upsert_many(&self, bars: &[DailyBar]) -> SignalResult<usize> {
        for bar in bars {
            self.upsert(bar).await?;
        }
        Ok(bars.len())
    }
}

#[async_trait]
impl BarStore for SqliteBarStore {
    async fn daily_bar(&self, symbol: &str, date: NaiveDate) -> SignalResult<Option<DailyBar>> {
        let row: Option<BarRow> = sqlx::query_as(
            "SELECT symbol, bar_date, open, high, low, close, volume
             FROM daily_bars WHERE symbol = ? AND bar_date = ?",
        )
        .bind(symbol)
        .bind(date.format(DATE_FORMAT).to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(SignalError::persistence)?;

        row.map(BarRow::into_bar).transpose()
    }
}

#[derive(sqlx::FromRow)]
struct BarRow {
    symbol: String,
    bar_date: String,
    open: String,
    high: String,
    low: String,
    close: String,
    volume: f64,
}

impl BarRow {
    fn into_bar(self) -> SignalResult<DailyBar> {
        let date = NaiveDate::parse_from_str(&self.bar_date, DATE_FORMAT).map_err(|e| {
            SignalError::Persistence(format!("bad bar date '{}': {}", self.bar_date, e))
        })?;
        Ok(DailyBar {
            date,
            open: parse_decimal(&self.open)?,
            high: parse_decimal(&self.high)?,
            low: parse_decimal(&self.low)?,
            close: parse_decimal(&self.close)?,
            volume: self.volume,
            symbol: self.symbol,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use signal_store::SignalStore;

    fn bar(close: rust_decimal::Decimal) -> DailyBar {
        DailyBar {
            symbol: "SPY".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 2, 5).unwrap(),
            open: dec!(490.10),
            high: dec!(494.00),
            low: dec!(488.25),
            close,
            volume: 71_000_000.0,
        }
    }

    #[tokio::test]
    async fn test_upsert_and_lookup() {
        let store = SignalStore::connect("sqlite::memory:").await.unwrap();
        let bars = SqliteBarStore::new(store.pool().clone());

        bars.upsert(&bar(dec!(492.55))).await.unwrap();
        bars.upsert(&bar(dec!(493.00))).await.unwrap();

        let found = bars
            .daily_bar("SPY", NaiveDate::from_ymd_opt(2024, 2, 5).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.close, dec!(493.00));
        assert_eq!(found.low.to_string(), "488.25");

        let missing = bars
            .daily_bar("SPY", NaiveDate::from_ymd_opt(2024, 2, 6).unwrap())
            .await
            .unwrap();
        assert!(missing.is_none());
    }
}
