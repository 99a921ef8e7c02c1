//! Industry and sector rollups.
//!
//! For each non-null group value:
//! - weighted metric = Σ(f·cap) / Σcap, null when Σcap is not positive
//! - equal metric = mean of non-null f
//! - momentum = week − month / 4 (for both weightings)
//! - top stocks = up to five members by week, descending, stable on ties
//!
//! Market caps arrive in millions and are scaled to absolute units first.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};

use crate::error::{AppError, Result};
use crate::types::{
    AggregateRow, GroupBy, Snapshot, SnapshotMeta, TickerRow, TopStock, MARKET_CAP,
    PERFORMANCE_MONTH, PERFORMANCE_WEEK, RSI_14, SECTOR,
};

pub const MARKET_CAP_SCALE: f64 = 1_000_000.0;
pub const TOP_STOCKS_LIMIT: usize = 5;
/// Weekly share of monthly performance subtracted in the momentum score.
pub const MOMENTUM_MONTH_DIVISOR: f64 = 4.0;

/// Incremental mode: aggregate the rows of the snapshot just made current.
pub fn aggregate_snapshot(snapshot: &Snapshot, group_by: GroupBy) -> Result<Vec<AggregateRow>> {
    aggregate(&snapshot.meta, &snapshot.rows, group_by)
}

/// Aggregate one snapshot's rows. Output is ordered by group name.
///
/// Fails if a row has no ticker or a ticker repeats, since either means the
/// input is not a single snapshot.
pub fn aggregate<'a>(
    meta: &SnapshotMeta,
    rows: impl IntoIterator<Item = &'a TickerRow>,
    group_by: GroupBy,
) -> Result<Vec<AggregateRow>> {
    let mut groups: BTreeMap<&'a str, Vec<&'a TickerRow>> = BTreeMap::new();
    let mut seen: HashSet<&'a str> = HashSet::new();

    for row in rows {
        let ticker = row.ticker().ok_or_else(|| {
            AppError::Aggregation(format!("row without ticker in snapshot {}", meta.snapshot_id))
        })?;
        if !seen.insert(ticker) {
            return Err(AppError::Aggregation(format!(
                "ticker {ticker} appears twice in snapshot {}",
                meta.snapshot_id
            )));
        }
        if let Some(name) = row.text(group_by.column()) {
            groups.entry(name).or_default().push(row);
        }
    }

    Ok(groups
        .into_iter()
        .map(|(name, members)| group_row(meta, name, &members, group_by))
        .collect())
}

/// Full-rebuild mode: partition historical rows by `(snapshot_id, is_current)`
/// and aggregate each partition. A partition's `processed_at` is the latest
/// one among its rows.
pub fn aggregate_history(
    history: &[(SnapshotMeta, TickerRow)],
    group_by: GroupBy,
) -> Result<Vec<AggregateRow>> {
    let mut partitions: BTreeMap<(&str, bool), (DateTime<Utc>, Vec<&TickerRow>)> = BTreeMap::new();
    for (meta, row) in history {
        let entry = partitions
            .entry((meta.snapshot_id.as_str(), meta.is_current))
            .or_insert_with(|| (meta.processed_at, Vec::new()));
        entry.0 = entry.0.max(meta.processed_at);
        entry.1.push(row);
    }

    let mut out = Vec::new();
    for ((snapshot_id, is_current), (processed_at, rows)) in partitions {
        let meta = SnapshotMeta {
            snapshot_id: snapshot_id.to_string(),
            processed_at,
            is_current,
        };
        out.extend(aggregate(&meta, rows, group_by)?);
    }
    Ok(out)
}

fn group_row(
    meta: &SnapshotMeta,
    name: &str,
    members: &[&TickerRow],
    group_by: GroupBy,
) -> AggregateRow {
    let caps: Vec<Option<f64>> = members
        .iter()
        .map(|r| r.number(MARKET_CAP).map(|c| c * MARKET_CAP_SCALE))
        .collect();
    let total_cap = sum(caps.iter().copied());

    let week = weighted(members, &caps, total_cap, PERFORMANCE_WEEK);
    let month = weighted(members, &caps, total_cap, PERFORMANCE_MONTH);
    let rsi = weighted(members, &caps, total_cap, RSI_14);

    let week_equal = mean(members, PERFORMANCE_WEEK);
    let month_equal = mean(members, PERFORMANCE_MONTH);
    let rsi_equal = mean(members, RSI_14);

    let parent_sector = match group_by {
        GroupBy::Industry => members
            .iter()
            .find_map(|r| r.text(SECTOR))
            .map(str::to_string),
        GroupBy::Sector => None,
    };

    AggregateRow {
        snapshot_id: meta.snapshot_id.clone(),
        processed_at: meta.processed_at,
        is_current: meta.is_current,
        name: name.to_string(),
        parent_sector,
        week,
        month,
        rsi,
        momentum: momentum(week, month),
        week_equal,
        month_equal,
        rsi_equal,
        momentum_equal: momentum(week_equal, month_equal),
        market_cap: total_cap,
        stock_count: members.len() as u64,
        top_stocks: top_stocks(members),
    }
}

/// Null when no member has a value, like SQL `SUM`.
fn sum(values: impl Iterator<Item = Option<f64>>) -> Option<f64> {
    values.flatten().fold(None, |acc, v| Some(acc.unwrap_or(0.0) + v))
}

fn weighted(
    members: &[&TickerRow],
    caps: &[Option<f64>],
    total_cap: Option<f64>,
    field: &str,
) -> Option<f64> {
    let total = total_cap.filter(|t| *t > 0.0)?;
    let numerator = sum(
        members
            .iter()
            .zip(caps)
            .map(|(r, cap)| Some(r.number(field)? * (*cap)?)),
    )?;
    Some(numerator / total)
}

fn mean(members: &[&TickerRow], field: &str) -> Option<f64> {
    let values: Vec<f64> = members.iter().filter_map(|r| r.number(field)).collect();
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

fn momentum(week: Option<f64>, month: Option<f64>) -> Option<f64> {
    Some(week? - month? / MOMENTUM_MONTH_DIVISOR)
}

fn top_stocks(members: &[&TickerRow]) -> Vec<TopStock> {
    let mut ranked: Vec<TopStock> = members
        .iter()
        .filter_map(|r| {
            Some(TopStock {
                ticker: r.ticker()?.to_string(),
                week: r.number(PERFORMANCE_WEEK)?,
            })
        })
        .collect();
    // sort_by is stable: equal weeks keep input order
    ranked.sort_by(|a, b| b.week.partial_cmp(&a.week).unwrap_or(Ordering::Equal));
    ranked.truncate(TOP_STOCKS_LIMIT);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Value, INDUSTRY, TICKER};

    fn meta(id: &str, is_current: bool) -> SnapshotMeta {
        SnapshotMeta {
            snapshot_id: id.to_string(),
            processed_at: DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap(),
            is_current,
        }
    }

    fn num(v: Option<f64>) -> Value {
        v.map(Value::Number).unwrap_or(Value::Null)
    }

    fn row(ticker: &str, industry: &str, sector: &str, cap: Option<f64>, week: Option<f64>, month: Option<f64>) -> TickerRow {
        [
            (TICKER, Value::Text(ticker.into())),
            (INDUSTRY, Value::Text(industry.into())),
            (SECTOR, Value::Text(sector.into())),
            (MARKET_CAP, num(cap)),
            (PERFORMANCE_WEEK, num(week)),
            (PERFORMANCE_MONTH, num(month)),
        ]
        .into_iter()
        .collect()
    }

    fn approx(a: Option<f64>, b: f64) {
        let a = a.expect("expected a value");
        assert!((a - b).abs() < 1e-9, "{a} != {b}");
    }

    #[test]
    fn weighted_week_uses_market_cap() {
        let rows = vec![
            row("A", "Software", "Technology", Some(100.0), Some(2.0), None),
            row("B", "Software", "Technology", Some(300.0), Some(6.0), None),
        ];
        let out = aggregate(&meta("s1", true), &rows, GroupBy::Industry).unwrap();
        assert_eq!(out.len(), 1);
        approx(out[0].week, 5.0);
        approx(out[0].week_equal, 4.0);
        approx(out[0].market_cap, 400.0 * MARKET_CAP_SCALE);
        assert_eq!(out[0].stock_count, 2);
        assert_eq!(out[0].parent_sector.as_deref(), Some("Technology"));
    }

    #[test]
    fn zero_market_cap_yields_null_weighted_metrics() {
        let rows = vec![
            row("A", "Shells", "Energy", Some(0.0), Some(2.0), Some(1.0)),
            row("B", "Shells", "Energy", Some(0.0), Some(4.0), Some(3.0)),
        ];
        let out = aggregate(&meta("s1", true), &rows, GroupBy::Industry).unwrap();
        assert_eq!(out[0].week, None);
        assert_eq!(out[0].month, None);
        assert_eq!(out[0].momentum, None);
        approx(out[0].week_equal, 3.0);
        approx(out[0].market_cap, 0.0);
    }

    #[test]
    fn missing_market_caps_yield_null_total() {
        let rows = vec![row("A", "Banks", "Financial", None, Some(1.0), Some(1.0))];
        let out = aggregate(&meta("s1", true), &rows, GroupBy::Sector).unwrap();
        assert_eq!(out[0].market_cap, None);
        assert_eq!(out[0].week, None);
        approx(out[0].week_equal, 1.0);
    }

    #[test]
    fn top_movers_exclude_nulls_and_sort_descending() {
        let rows = vec![
            row("W", "Chips", "Technology", Some(1.0), Some(5.0), None),
            row("X", "Chips", "Technology", Some(1.0), None, None),
            row("Y", "Chips", "Technology", Some(1.0), Some(9.0), None),
            row("Z", "Chips", "Technology", Some(1.0), Some(1.0), None),
        ];
        let out = aggregate(&meta("s1", true), &rows, GroupBy::Industry).unwrap();
        let top: Vec<(&str, f64)> = out[0].top_stocks.iter().map(|t| (t.ticker.as_str(), t.week)).collect();
        assert_eq!(top, vec![("Y", 9.0), ("W", 5.0), ("Z", 1.0)]);
        assert_eq!(out[0].stock_count, 4);
    }

    #[test]
    fn top_movers_truncate_to_five_with_stable_ties() {
        let rows: Vec<TickerRow> = ["A", "B", "C", "D", "E", "F", "G"]
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let week = if i == 6 { 10.0 } else { 2.0 };
                row(t, "Retail", "Consumer", Some(1.0), Some(week), None)
            })
            .collect();
        let out = aggregate(&meta("s1", true), &rows, GroupBy::Industry).unwrap();
        let tickers: Vec<&str> = out[0].top_stocks.iter().map(|t| t.ticker.as_str()).collect();
        assert_eq!(tickers, vec!["G", "A", "B", "C", "D"]);
    }

    #[test]
    fn momentum_subtracts_quarter_month() {
        let rows = vec![row("A", "Biotech", "Healthcare", Some(50.0), Some(5.0), Some(8.0))];
        let out = aggregate(&meta("s1", true), &rows, GroupBy::Industry).unwrap();
        approx(out[0].momentum, 3.0);
        approx(out[0].momentum_equal, 3.0);
    }

    #[test]
    fn null_group_values_are_excluded() {
        let mut orphan = row("N", "", "", Some(10.0), Some(1.0), None);
        orphan.insert(INDUSTRY, Value::Null);
        let rows = vec![orphan, row("A", "Software", "Technology", Some(1.0), Some(1.0), None)];
        let out = aggregate(&meta("s1", true), &rows, GroupBy::Industry).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name, "Software");
        assert_eq!(out[0].stock_count, 1);
    }

    #[test]
    fn sector_rows_have_no_parent() {
        let rows = vec![
            row("A", "Software", "Technology", Some(1.0), Some(1.0), None),
            row("B", "Chips", "Technology", Some(1.0), Some(3.0), None),
        ];
        let out = aggregate(&meta("s1", true), &rows, GroupBy::Sector).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name, "Technology");
        assert_eq!(out[0].parent_sector, None);
        assert_eq!(out[0].stock_count, 2);
    }

    #[test]
    fn duplicate_ticker_is_an_error() {
        let rows = vec![
            row("A", "Software", "Technology", Some(1.0), Some(1.0), None),
            row("A", "Software", "Technology", Some(1.0), Some(1.0), None),
        ];
        let err = aggregate(&meta("s1", true), &rows, GroupBy::Industry).unwrap_err();
        assert!(matches!(err, AppError::Aggregation(_)));
    }

    #[test]
    fn history_partitions_by_snapshot_and_flag() {
        let history = vec![
            (meta("s1", false), row("A", "Software", "Technology", Some(100.0), Some(1.0), None)),
            (meta("s1", false), row("B", "Software", "Technology", Some(100.0), Some(3.0), None)),
            (meta("s2", true), row("A", "Software", "Technology", Some(100.0), Some(7.0), None)),
        ];
        let out = aggregate_history(&history, GroupBy::Industry).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].snapshot_id, "s1");
        assert!(!out[0].is_current);
        assert_eq!(out[0].stock_count, 2);
        approx(out[0].week, 2.0);
        assert_eq!(out[1].snapshot_id, "s2");
        assert!(out[1].is_current);
        approx(out[1].week, 7.0);
    }
}
