use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use signal_core::{ArchiveReason, Signal, SignalError, SignalResult, SignalState};
use sqlx::sqlite::{Sqlite, SqliteConnection};
use sqlx::Transaction;
use tokio::sync::MutexGuard;

use crate::db::{archive_active, fetch_active, format_ts, insert_active, SignalStore};

/// Outcome of one archive-then-replace rotation
#[derive(Debug, Clone, Default)]
pub struct RotationReport {
    pub cycle_id: Option<String>,
    pub archived: u64,
    pub inserted_ids: Vec<i64>,
}

/// Owns every state change of persisted signals.
pub struct LifecycleManager {
    store: SignalStore,
}

impl LifecycleManager {
    pub fn new(store: SignalStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &SignalStore {
        &self.store
    }

    /// Replace the active set with `new_signals` in one transaction.
    ///
    /// Every currently active row is copied to history (ROTATION) and deleted
    /// before the new rows are inserted. Any failure rolls the whole rotation
    /// back, so the previous cycle stays authoritative.
    pub async fn rotate(&self, new_signals: &[Signal], now: DateTime<Utc>) -> SignalResult<RotationReport> {
        for signal in new_signals {
            if signal.id.is_some() {
                return Err(SignalError::Validation(format!(
                    "{} already persisted as #{}",
                    signal.symbol,
                    signal.id.unwrap_or_default()
                )));
            }
            if !signal.is_valid || signal.is_executed {
                return Err(SignalError::Validation(format!(
                    "{} is not publishable (valid={}, executed={})",
                    signal.symbol, signal.is_valid, signal.is_executed
                )));
            }
        }

        let _guard = self.store.lock_cycle().await;
        let mut tx = self.store.pool().begin().await.map_err(SignalError::persistence)?;

        let archived = archive_active(&mut tx, None, ArchiveReason::Rotation, now).await?;

        let mut inserted_ids = Vec::with_capacity(new_signals.len());
        for signal in new_signals {
            inserted_ids.push(insert_active(&mut tx, signal).await?);
        }

        tx.commit().await.map_err(SignalError::persistence)?;

        let cycle_id = new_signals.first().and_then(|s| s.metadata.cycle_id.clone());
        tracing::info!(
            "Rotated active set: {} archived, {} inserted (cycle {})",
            archived,
            inserted_ids.len(),
            cycle_id.as_deref().unwrap_or("-")
        );

        Ok(RotationReport {
            cycle_id,
            archived,
            inserted_ids,
        })
    }

    /// Flag active, unexecuted signals past their expiry. Returns how many changed.
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> SignalResult<u64> {
        let _guard = self.store.lock_cycle().await;

        let result = sqlx::query(
            "UPDATE active_signals SET is_valid = 0
             WHERE is_valid = 1 AND is_executed = 0 AND expires_at < ?",
        )
        .bind(format_ts(now))
        .execute(self.store.pool())
        .await
        .map_err(SignalError::persistence)?;

        if result.rows_affected() > 0 {
            tracing::info!("Expired {} stale signals", result.rows_affected());
        }
        Ok(result.rows_affected())
    }

    /// Record an execution at `price`. `pnl_percent` is relative to entry, in percent.
    ///
    /// The state is judged as of `executed_at`: an execution after expiry or a
    /// second execution is refused.
    pub async fn mark_executed(
        &self,
        id: i64,
        price: Decimal,
        executed_at: DateTime<Utc>,
        pnl_percent: f64,
    ) -> SignalResult<()> {
        let mut batch = self.begin().await?;
        batch.mark_executed(id, price, executed_at, pnl_percent).await?;
        batch.commit().await
    }

    /// Open a transaction under the cycle lock. Dropping it uncommitted rolls
    /// every change back.
    pub async fn begin(&self) -> SignalResult<LifecycleTx<'_>> {
        let guard = self.store.lock_cycle().await;
        let tx = self.store.pool().begin().await.map_err(SignalError::persistence)?;
        Ok(LifecycleTx { tx, _guard: guard })
    }

    /// Move specific signals to history with reason MANUAL. All or nothing.
    pub async fn archive(&self, ids: &[i64], now: DateTime<Utc>) -> SignalResult<u64> {
        let _guard = self.store.lock_cycle().await;
        let mut tx = self.store.pool().begin().await.map_err(SignalError::persistence)?;

        for id in ids {
            let signal = fetch_active(&mut tx, *id)
                .await?
                .ok_or_else(|| SignalError::DataNotFound(format!("active signal #{}", id)))?;
            signal.state_at(now).transition(SignalState::Archived)?;
        }

        let moved = archive_active(&mut tx, Some(ids), ArchiveReason::Manual, now).await?;
        tx.commit().await.map_err(SignalError::persistence)?;

        tracing::info!("Manually archived {} signals", moved);
        Ok(moved)
    }
}

/// Several lifecycle writes committed together.
pub struct LifecycleTx<'a> {
    // Dropped before the guard, so a rollback happens under the lock.
    tx: Transaction<'static, Sqlite>,
    _guard: MutexGuard<'a, ()>,
}

impl LifecycleTx<'_> {
    /// Same rules as [`LifecycleManager::mark_executed`]. A refused transition
    /// writes nothing and leaves the transaction usable.
    pub async fn mark_executed(
        &mut self,
        id: i64,
        price: Decimal,
        executed_at: DateTime<Utc>,
        pnl_percent: f64,
    ) -> SignalResult<()> {
        let signal = fetch_active(&mut self.tx, id)
            .await?
            .ok_or_else(|| SignalError::DataNotFound(format!("active signal #{}", id)))?;

        let state = if signal.is_executed {
            SignalState::Executed
        } else if executed_at > signal.expires_at {
            SignalState::Expired
        } else {
            SignalState::Active
        };
        state.transition(SignalState::Executed)?;

        let result = sqlx::query(
            "UPDATE active_signals
             SET is_executed = 1, is_valid = 0, executed_at = ?, execution_price = ?,
                 is_profitable = ?, profit_loss = ?
             WHERE id = ? AND is_executed = 0",
        )
        .bind(format_ts(executed_at))
        .bind(price.to_string())
        .bind(pnl_percent > 0.0)
        .bind(pnl_percent)
        .bind(id)
        .execute(&mut *self.tx)
        .await
        .map_err(SignalError::persistence)?;

        if result.rows_affected() != 1 {
            return Err(SignalError::InvalidTransition {
                from: format!("{:?}", SignalState::Executed),
                to: format!("{:?}", SignalState::Executed),
            });
        }

        tracing::debug!("Signal #{} ({}) executed at {}", id, signal.symbol, price);
        Ok(())
    }

    /// The transaction's connection, for writes owned by other tables.
    pub fn connection(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    pub async fn commit(self) -> SignalResult<()> {
        self.tx.commit().await.map_err(SignalError::persistence)
    }
}
