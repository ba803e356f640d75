use std::collections::BTreeMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal_macros::dec;
use signal_core::{
    ArchiveReason, ConfidenceLevel, Direction, Signal, SignalMetadata, SignalStrength,
};
use tokio_test::assert_ok;

use crate::db::SignalStore;
use crate::dedup::{DedupScope, DuplicateRemover};
use crate::lifecycle::LifecycleManager;

pub(crate) async fn store() -> SignalStore {
    SignalStore::connect("sqlite::memory:").await.unwrap()
}

/// A valid BUY (100 / 110 / 95) or SELL (100 / 90 / 105) signal, not yet persisted.
pub(crate) fn signal(symbol: &str, direction: Direction, created_at: DateTime<Utc>) -> Signal {
    let (target, stop) = match direction {
        Direction::Sell => (dec!(90), dec!(105)),
        _ => (dec!(110), dec!(95)),
    };
    let mut factor_scores = BTreeMap::new();
    factor_scores.insert("technical".to_string(), 0.72);

    Signal {
        id: None,
        symbol: symbol.to_string(),
        direction,
        strength: SignalStrength::Strong,
        confidence_score: 0.7,
        confidence_level: ConfidenceLevel::High,
        entry_price: dec!(100),
        target_price: target,
        stop_loss: stop,
        risk_reward_ratio: 2.0,
        factor_scores,
        quality_score: 0.8,
        is_valid: true,
        created_at,
        expires_at: created_at + Duration::hours(24),
        is_executed: false,
        executed_at: None,
        execution_price: None,
        is_profitable: None,
        profit_loss: None,
        metadata: SignalMetadata {
            cycle_id: Some("cycle-test".to_string()),
            strategy_id: Some("momentum".to_string()),
            ..SignalMetadata::default()
        },
    }
}

fn day(d: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, d, hour, 0, 0).unwrap()
}

/// Bypasses rotation so that several cycles' worth of rows coexist.
async fn seed(store: &SignalStore, signals: &[Signal]) -> Vec<i64> {
    let mut conn = store.pool().acquire().await.unwrap();
    let mut ids = Vec::new();
    for s in signals {
        ids.push(crate::db::insert_active(&mut conn, s).await.unwrap());
    }
    ids
}

#[tokio::test]
async fn test_signal_round_trip_is_exact() {
    let store = store().await;
    let mut original = signal("AAPL", Direction::Sell, day(4, 14));
    original.entry_price = dec!(187.3125);
    original.metadata.composite_score = Some(0.8125);

    let ids = seed(&store, &[original.clone()]).await;
    let loaded = store.active_signal(ids[0]).await.unwrap().unwrap();

    assert_eq!(loaded.id, Some(ids[0]));
    assert_eq!(loaded.entry_price.to_string(), "187.3125");
    assert_eq!(loaded.direction, Direction::Sell);
    assert_eq!(loaded.created_at, original.created_at);
    assert_eq!(loaded.factor_scores, original.factor_scores);
    assert_eq!(loaded.metadata, original.metadata);
}

#[tokio::test]
async fn test_dedup_keeps_one_survivor_per_group() {
    let store = store().await;
    let mut late_confident = signal("AAPL", Direction::Buy, day(4, 15));
    late_confident.confidence_score = 0.95;
    let ids = seed(
        &store,
        &[
            late_confident,
            signal("AAPL", Direction::Buy, day(4, 10)),
            signal("AAPL", Direction::Sell, day(4, 10)),
            signal("MSFT", Direction::Buy, day(4, 10)),
        ],
    )
    .await;

    let remover = DuplicateRemover::new(store.clone(), 0.01).unwrap();
    let report = remover.run(&DedupScope::All, false, day(5, 0)).await.unwrap();

    assert_eq!(report.scanned, 4);
    assert_eq!(report.groups.len(), 1);
    assert_eq!(report.groups[0].survivor_id, ids[1]);
    assert_eq!(report.removed_ids, vec![ids[0]]);

    let active = store.active_snapshot().await.unwrap();
    assert_eq!(active.len(), 3);
    let survivor = active.iter().find(|s| s.id == Some(ids[1])).unwrap();
    assert_eq!(survivor.metadata.duplicate_group.as_deref(), Some(format!("dup-{}", ids[1]).as_str()));

    let archived = store.history_by_reason(ArchiveReason::Duplicate).await.unwrap();
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].signal.id, Some(ids[0]));
    assert_eq!(archived[0].signal.metadata.duplicate_group, survivor.metadata.duplicate_group);
}

#[tokio::test]
async fn test_dedup_is_idempotent() {
    let store = store().await;
    let mut near = signal("AAPL", Direction::Buy, day(6, 10));
    near.entry_price = dec!(100.5);
    seed(
        &store,
        &[
            signal("AAPL", Direction::Buy, day(4, 10)),
            signal("AAPL", Direction::Buy, day(4, 11)),
            near,
            signal("NVDA", Direction::Buy, day(4, 10)),
        ],
    )
    .await;

    let remover = DuplicateRemover::new(store.clone(), 0.01).unwrap();
    let first = remover.run(&DedupScope::All, false, day(7, 0)).await.unwrap();
    assert_eq!(first.removed_ids.len(), 2);
    let after_first = store.active_snapshot().await.unwrap();

    let second = remover.run(&DedupScope::All, false, day(7, 1)).await.unwrap();
    assert!(second.groups.is_empty());
    assert!(second.removed_ids.is_empty());

    let after_second = store.active_snapshot().await.unwrap();
    let ids = |set: &[Signal]| set.iter().map(|s| s.id).collect::<Vec<_>>();
    assert_eq!(ids(&after_first), ids(&after_second));
}

#[tokio::test]
async fn test_dry_run_reports_without_mutation() {
    let store = store().await;
    seed(
        &store,
        &[
            signal("AAPL", Direction::Buy, day(4, 10)),
            signal("AAPL", Direction::Buy, day(4, 12)),
        ],
    )
    .await;

    let remover = DuplicateRemover::new(store.clone(), 0.01).unwrap();
    let report = remover.run(&DedupScope::All, true, day(5, 0)).await.unwrap();
    assert!(report.dry_run);
    assert_eq!(report.removed_ids.len(), 1);

    assert_eq!(store.active_count().await.unwrap(), 2);
    assert!(store.history(10).await.unwrap().is_empty());
    let active = store.active_snapshot().await.unwrap();
    assert!(active.iter().all(|s| s.metadata.duplicate_group.is_none()));
}

#[tokio::test]
async fn test_scoped_sweeps() {
    let store = store().await;
    seed(
        &store,
        &[
            signal("AAPL", Direction::Buy, day(1, 10)),
            signal("AAPL", Direction::Buy, day(1, 11)),
            signal("MSFT", Direction::Buy, day(9, 10)),
            signal("MSFT", Direction::Buy, day(9, 11)),
        ],
    )
    .await;
    let remover = DuplicateRemover::new(store.clone(), 0.01).unwrap();
    let now = day(10, 0);

    let by_symbol = remover
        .run(&DedupScope::Symbol("MSFT".to_string()), true, now)
        .await
        .unwrap();
    assert_eq!(by_symbol.scanned, 2);

    let by_range = remover
        .run(
            &DedupScope::DateRange {
                from: day(9, 0).date_naive(),
                to: day(9, 0).date_naive(),
            },
            true,
            now,
        )
        .await
        .unwrap();
    assert_eq!(by_range.scanned, 2);

    // only the AAPL pair is older than five days
    let old = remover.cleanup_old(5, false, now).await.unwrap();
    assert_eq!(old.scanned, 2);
    assert_eq!(old.removed_ids.len(), 1);
    assert_eq!(store.active_count().await.unwrap(), 3);

    assert!(remover.cleanup_old(0, true, now).await.is_err());
}

#[tokio::test]
async fn test_remover_rejects_bad_tolerance() {
    let store = store().await;
    assert!(DuplicateRemover::new(store.clone(), -0.01).is_err());
    assert!(DuplicateRemover::new(store.clone(), 1.0).is_err());
    assert!(DuplicateRemover::new(store, f64::NAN).is_err());
}

#[tokio::test]
async fn test_snapshot_never_mixes_cycles() {
    let store = store().await;
    let lifecycle = LifecycleManager::new(store.clone());

    let mut first = signal("AAPL", Direction::Buy, day(4, 10));
    first.metadata.cycle_id = Some("c1".to_string());
    assert_ok!(lifecycle.rotate(&[first], day(4, 10)).await);

    let mut a = signal("MSFT", Direction::Buy, day(4, 11));
    a.metadata.cycle_id = Some("c2".to_string());
    let mut b = signal("NVDA", Direction::Sell, day(4, 11));
    b.metadata.cycle_id = Some("c2".to_string());
    assert_ok!(lifecycle.rotate(&[a, b], day(4, 11)).await);

    let active = store.active_snapshot().await.unwrap();
    assert_eq!(active.len(), 2);
    assert!(active
        .iter()
        .all(|s| s.metadata.cycle_id.as_deref() == Some("c2")));
    assert_eq!(store.history(10).await.unwrap().len(), 1);
}
