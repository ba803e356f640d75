use std::cmp::Ordering;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use signal_core::{ArchiveReason, Direction, Signal, SignalError, SignalResult};

use crate::db::{archive_active, format_ts, SignalRow, SignalStore, SIGNAL_COLUMNS};

/// Which part of the active set a sweep looks at
#[derive(Debug, Clone, PartialEq)]
pub enum DedupScope {
    All,
    Symbol(String),
    /// Inclusive calendar dates of `created_at`
    DateRange { from: NaiveDate, to: NaiveDate },
    /// Signals created strictly before the cutoff
    OlderThan(DateTime<Utc>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroup {
    /// `dup-<survivor id>`, stable across runs
    pub group_id: String,
    pub survivor_id: i64,
    /// Everything but the survivor, in survivor-rank order
    pub duplicate_ids: Vec<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct DedupReport {
    pub scanned: usize,
    pub groups: Vec<DuplicateGroup>,
    pub removed_ids: Vec<i64>,
    pub dry_run: bool,
}

/// Earliest `created_at`, then highest confidence, then lowest id.
fn survivor_order(a: (i64, &Signal), b: (i64, &Signal)) -> Ordering {
    a.1.created_at
        .cmp(&b.1.created_at)
        .then_with(|| b.1.confidence_score.total_cmp(&a.1.confidence_score))
        .then_with(|| a.0.cmp(&b.0))
}

/// Price-triplet rule. `a` is the higher-ranked signal and sets the band.
fn prices_within(a: &Signal, b: &Signal, tolerance: Decimal) -> bool {
    let band = tolerance * a.entry_price;
    (a.entry_price - b.entry_price).abs() <= band
        && (a.target_price - b.target_price).abs() <= band
        && (a.stop_loss - b.stop_loss).abs() <= band
}

struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        while self.parent[x] != root {
            let next = self.parent[x];
            self.parent[x] = root;
            x = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            Ordering::Less => self.parent[ra] = rb,
            Ordering::Greater => self.parent[rb] = ra,
            Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

/// Group persisted signals that match on (symbol, direction, date) or on the
/// price triplet within `tolerance` (a fraction of entry, e.g. 0.01).
///
/// Only groups with more than one member are returned, ordered by survivor rank.
/// Signals without an id are ignored.
pub fn find_duplicate_groups(signals: &[Signal], tolerance: Decimal) -> Vec<DuplicateGroup> {
    let mut ranked: Vec<(i64, &Signal)> = signals
        .iter()
        .filter_map(|s| s.id.map(|id| (id, s)))
        .collect();
    ranked.sort_by(|a, b| survivor_order(*a, *b));

    let mut uf = UnionFind::new(ranked.len());
    let mut first_by_day: HashMap<(&str, Direction, NaiveDate), usize> = HashMap::new();
    let mut by_slot: HashMap<(&str, Direction), Vec<usize>> = HashMap::new();

    for (i, (_, s)) in ranked.iter().enumerate() {
        match first_by_day.entry((s.symbol.as_str(), s.direction, s.calendar_date())) {
            Entry::Occupied(first) => uf.union(*first.get(), i),
            Entry::Vacant(slot) => {
                slot.insert(i);
            }
        }
        by_slot.entry((s.symbol.as_str(), s.direction)).or_default().push(i);
    }

    // Indices inside a slot are ascending, so `i` always outranks `j`.
    for indices in by_slot.values() {
        for (pos, &i) in indices.iter().enumerate() {
            for &j in &indices[pos + 1..] {
                if prices_within(ranked[i].1, ranked[j].1, tolerance) {
                    uf.union(i, j);
                }
            }
        }
    }

    let mut members: HashMap<usize, Vec<usize>> = HashMap::new();
    for i in 0..ranked.len() {
        let root = uf.find(i);
        members.entry(root).or_default().push(i);
    }

    let mut groups: Vec<Vec<usize>> = members.into_values().filter(|m| m.len() > 1).collect();
    groups.sort_by_key(|m| m[0]);

    groups
        .into_iter()
        .map(|m| {
            let survivor_id = ranked[m[0]].0;
            DuplicateGroup {
                group_id: format!("dup-{}", survivor_id),
                survivor_id,
                duplicate_ids: m[1..].iter().map(|&i| ranked[i].0).collect(),
            }
        })
        .collect()
}

/// Applies duplicate groups to the store.
pub struct DuplicateRemover {
    store: SignalStore,
    tolerance: Decimal,
}

impl DuplicateRemover {
    pub fn new(store: SignalStore, tolerance_percentage: f64) -> SignalResult<Self> {
        if !tolerance_percentage.is_finite() || !(0.0..1.0).contains(&tolerance_percentage) {
            return Err(SignalError::Config(format!(
                "duplicate tolerance must be in [0, 1), got {}",
                tolerance_percentage
            )));
        }
        let tolerance = Decimal::from_f64(tolerance_percentage).ok_or_else(|| {
            SignalError::Config(format!("unrepresentable tolerance {}", tolerance_percentage))
        })?;
        Ok(Self { store, tolerance })
    }

    /// One sweep over `scope`. Nothing is written when `dry_run` is set.
    ///
    /// All archive moves and metadata updates share one transaction: on any
    /// error nothing is removed.
    pub async fn run(&self, scope: &DedupScope, dry_run: bool, now: DateTime<Utc>) -> SignalResult<DedupReport> {
        let _guard = self.store.lock_cycle().await;
        let mut tx = self.store.pool().begin().await.map_err(SignalError::persistence)?;

        let signals = load_scope(&mut tx, scope).await?;
        let groups = find_duplicate_groups(&signals, self.tolerance);
        let removed_ids: Vec<i64> = groups
            .iter()
            .flat_map(|g| g.duplicate_ids.iter().copied())
            .collect();

        let report = DedupReport {
            scanned: signals.len(),
            groups,
            removed_ids,
            dry_run,
        };

        if dry_run {
            tracing::info!(
                "Dry run: {} signals scanned, {} duplicate groups, {} would be removed",
                report.scanned,
                report.groups.len(),
                report.removed_ids.len()
            );
            return Ok(report);
        }

        let by_id: HashMap<i64, &Signal> = signals
            .iter()
            .filter_map(|s| s.id.map(|id| (id, s)))
            .collect();

        for group in &report.groups {
            let members = std::iter::once(&group.survivor_id).chain(group.duplicate_ids.iter());
            for id in members {
                let Some(signal) = by_id.get(id) else { continue };
                let mut metadata = signal.metadata.clone();
                metadata.duplicate_group = Some(group.group_id.clone());
                let metadata = serde_json::to_string(&metadata).map_err(SignalError::persistence)?;

                sqlx::query("UPDATE active_signals SET metadata = ? WHERE id = ?")
                    .bind(metadata)
                    .bind(*id)
                    .execute(&mut *tx)
                    .await
                    .map_err(SignalError::persistence)?;
            }

            archive_active(&mut tx, Some(&group.duplicate_ids), ArchiveReason::Duplicate, now).await?;
        }

        tx.commit().await.map_err(SignalError::persistence)?;

        tracing::info!(
            "Duplicate sweep: {} signals scanned, {} groups, {} removed",
            report.scanned,
            report.groups.len(),
            report.removed_ids.len()
        );
        Ok(report)
    }

    /// Sweep only signals created more than `days` days before `now`.
    pub async fn cleanup_old(&self, days: i64, dry_run: bool, now: DateTime<Utc>) -> SignalResult<DedupReport> {
        if days <= 0 {
            return Err(SignalError::Validation(format!(
                "cleanup window must be positive, got {} days",
                days
            )));
        }
        self.run(&DedupScope::OlderThan(now - Duration::days(days)), dry_run, now)
            .await
    }
}

async fn load_scope(conn: &mut sqlx::SqliteConnection, scope: &DedupScope) -> SignalResult<Vec<Signal>> {
    let (filter, binds): (&str, Vec<String>) = match scope {
        DedupScope::All => ("", Vec::new()),
        DedupScope::Symbol(symbol) => ("WHERE symbol = ?", vec![symbol.clone()]),
        DedupScope::DateRange { from, to } => {
            if from > to {
                return Err(SignalError::Validation(format!(
                    "empty date range {} .. {}",
                    from, to
                )));
            }
            let end = to
                .succ_opt()
                .ok_or_else(|| SignalError::Validation(format!("date out of range: {}", to)))?;
            (
                "WHERE created_at >= ? AND created_at < ?",
                vec![
                    format_ts(from.and_time(NaiveTime::MIN).and_utc()),
                    format_ts(end.and_time(NaiveTime::MIN).and_utc()),
                ],
            )
        }
        DedupScope::OlderThan(cutoff) => ("WHERE created_at < ?", vec![format_ts(*cutoff)]),
    };

    let sql = format!(
        "SELECT id, {} FROM active_signals {} ORDER BY id",
        SIGNAL_COLUMNS, filter
    );
    let mut query = sqlx::query_as::<_, SignalRow>(&sql);
    for value in binds {
        query = query.bind(value);
    }

    let rows = query
        .fetch_all(&mut *conn)
        .await
        .map_err(SignalError::persistence)?;
    rows.into_iter().map(SignalRow::into_signal).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::signal;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, hour, 0, 0).unwrap()
    }

    fn persisted(id: i64, symbol: &str, created_at: DateTime<Utc>, confidence: f64) -> Signal {
        let mut s = signal(symbol, Direction::Buy, created_at);
        s.id = Some(id);
        s.confidence_score = confidence;
        s
    }

    #[test]
    fn test_same_day_key_groups_and_ranks_survivor() {
        let signals = vec![
            persisted(1, "AAPL", at(4, 15), 0.9),
            persisted(2, "AAPL", at(4, 10), 0.6),
            persisted(3, "AAPL", at(4, 10), 0.8),
            persisted(4, "MSFT", at(4, 10), 0.8),
        ];
        let groups = find_duplicate_groups(&signals, dec!(0));
        assert_eq!(
            groups,
            vec![DuplicateGroup {
                group_id: "dup-3".to_string(),
                survivor_id: 3,
                duplicate_ids: vec![2, 1],
            }]
        );
    }

    #[test]
    fn test_lowest_id_breaks_full_tie() {
        let signals = vec![
            persisted(9, "AAPL", at(4, 10), 0.7),
            persisted(5, "AAPL", at(4, 10), 0.7),
        ];
        let groups = find_duplicate_groups(&signals, dec!(0.01));
        assert_eq!(groups[0].survivor_id, 5);
    }

    #[test]
    fn test_price_triplet_links_across_days() {
        let mut far = persisted(2, "AAPL", at(6, 10), 0.7);
        far.entry_price = dec!(100.9);
        far.target_price = dec!(110.5);
        far.stop_loss = dec!(95.8);
        let mut outside = persisted(3, "AAPL", at(8, 10), 0.7);
        outside.entry_price = dec!(101.5);
        outside.target_price = dec!(112);

        let signals = vec![persisted(1, "AAPL", at(4, 10), 0.7), far, outside];
        let groups = find_duplicate_groups(&signals, dec!(0.01));
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].survivor_id, 1);
        assert_eq!(groups[0].duplicate_ids, vec![2]);
    }

    #[test]
    fn test_band_boundary_is_inclusive() {
        let mut edge = persisted(2, "AAPL", at(5, 10), 0.7);
        edge.entry_price = dec!(101);
        let signals = vec![persisted(1, "AAPL", at(4, 10), 0.7), edge];
        assert_eq!(find_duplicate_groups(&signals, dec!(0.01)).len(), 1);
    }

    #[test]
    fn test_matching_is_transitive() {
        // 1~2 by date, 2~3 by prices, 1 and 3 match on neither
        let mut b = persisted(2, "AAPL", at(4, 12), 0.7);
        b.entry_price = dec!(120);
        b.target_price = dec!(130);
        b.stop_loss = dec!(115);
        let mut c = persisted(3, "AAPL", at(7, 12), 0.7);
        c.entry_price = dec!(120.5);
        c.target_price = dec!(130);
        c.stop_loss = dec!(115);

        let groups = find_duplicate_groups(&[persisted(1, "AAPL", at(4, 10), 0.7), b, c], dec!(0.01));
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].duplicate_ids, vec![2, 3]);
    }

    #[test]
    fn test_direction_and_symbol_separate_groups() {
        let mut sell = persisted(2, "AAPL", at(4, 11), 0.7);
        sell.direction = Direction::Sell;
        let signals = vec![
            persisted(1, "AAPL", at(4, 10), 0.7),
            sell,
            persisted(3, "MSFT", at(4, 10), 0.7),
        ];
        assert!(find_duplicate_groups(&signals, dec!(0.01)).is_empty());
    }

    #[test]
    fn test_unpersisted_signals_are_ignored() {
        let mut fresh = persisted(2, "AAPL", at(4, 11), 0.7);
        fresh.id = None;
        let signals = vec![persisted(1, "AAPL", at(4, 10), 0.7), fresh];
        assert!(find_duplicate_groups(&signals, dec!(0.01)).is_empty());
    }
}
