use chrono::{DateTime, NaiveTime, Utc};
use rayon::prelude::*;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use signal_core::{BacktestOutcome, DailyBar, Direction, ExecutionStatus, Signal};

/// Replay one signal against the daily bar of its issue date.
///
/// Only OHLC is known, so the order of events inside the bar is not. When a
/// bar reaches both the target and the stop, the target wins: it is checked
/// first for both directions.
pub fn replay(signal: &Signal, bar: &DailyBar) -> BacktestOutcome {
    if bar.symbol != signal.symbol || bar.date != signal.calendar_date() {
        return BacktestOutcome::error(
            signal,
            format!(
                "bar {} {} does not cover signal issued {}",
                bar.symbol,
                bar.date,
                signal.calendar_date()
            ),
        );
    }

    let (status, exit) = match signal.direction {
        Direction::Buy => {
            if bar.high >= signal.target_price {
                (ExecutionStatus::TargetHit, signal.target_price)
            } else if bar.low <= signal.stop_loss {
                (ExecutionStatus::StopLossHit, signal.stop_loss)
            } else {
                (ExecutionStatus::EndOfDay, bar.close)
            }
        }
        Direction::Sell => {
            if bar.low <= signal.target_price {
                (ExecutionStatus::TargetHit, signal.target_price)
            } else if bar.high >= signal.stop_loss {
                (ExecutionStatus::StopLossHit, signal.stop_loss)
            } else {
                (ExecutionStatus::EndOfDay, bar.close)
            }
        }
        Direction::Hold => return BacktestOutcome::error(signal, "HOLD signals cannot be replayed"),
    };

    let Some(pnl_percent) = pnl_percent(signal.direction, signal.entry_price, exit) else {
        return BacktestOutcome::error(signal, format!("invalid entry price {}", signal.entry_price));
    };

    BacktestOutcome {
        symbol: signal.symbol.clone(),
        signal_id: signal.id,
        status,
        execution_price: Some(exit),
        execution_time: Some(bar_time(bar).max(signal.created_at)),
        pnl_percent: Some(pnl_percent),
        error: None,
    }
}

/// Replay pre-fetched pairs in parallel. Output order matches input order.
/// A missing bar yields NOT_EXECUTED.
pub fn replay_all(pairs: &[(Signal, Option<DailyBar>)]) -> Vec<BacktestOutcome> {
    pairs
        .par_iter()
        .map(|(signal, bar)| match bar {
            Some(bar) => replay(signal, bar),
            None => BacktestOutcome::not_executed(signal),
        })
        .collect()
}

/// Signed return in percent of entry, positive when the trade made money.
pub fn pnl_percent(direction: Direction, entry: Decimal, exit: Decimal) -> Option<f64> {
    if entry <= Decimal::ZERO {
        return None;
    }
    let gain = match direction {
        Direction::Sell => entry - exit,
        _ => exit - entry,
    };
    (gain.checked_div(entry)? * Decimal::ONE_HUNDRED).to_f64()
}

/// Start of the bar's day (UTC). Executions are stamped no earlier than the
/// signal's issue time, since a daily bar cannot say when intraday it happened.
fn bar_time(bar: &DailyBar) -> DateTime<Utc> {
    bar.date.and_time(NaiveTime::MIN).and_utc()
}
