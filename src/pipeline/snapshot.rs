use chrono::{DateTime, SubsecRound, Utc};
use tracing::debug;

use crate::table::Table;
use crate::types::{Snapshot, SnapshotMeta, TickerRow, Value};

/// Timestamp granularity of a run. Every row of one snapshot shares the
/// truncated `processed_at` and therefore the same `snapshot_id`.
const SUBSEC_DIGITS: u16 = 6;

/// String form of a truncated processing timestamp, e.g.
/// `2024-01-05 21:30:00.123456 UTC`.
pub fn snapshot_id(processed_at: DateTime<Utc>) -> String {
    processed_at
        .trunc_subsecs(SUBSEC_DIGITS)
        .format("%Y-%m-%d %H:%M:%S%.6f UTC")
        .to_string()
}

pub fn snapshot_meta(now: DateTime<Utc>) -> SnapshotMeta {
    let processed_at = now.trunc_subsecs(SUBSEC_DIGITS);
    SnapshotMeta {
        snapshot_id: snapshot_id(processed_at),
        processed_at,
        is_current: true,
    }
}

/// Stamp a normalized table as the new current snapshot.
///
/// A column is percent-formatted when it holds `%`-suffixed text and every
/// such value is a number once the `%` is stripped. Those columns are
/// converted to numbers; values in them that do not parse become null.
pub fn build(table: Table, now: DateTime<Utc>) -> Snapshot {
    let meta = snapshot_meta(now);
    let (columns, rows) = table.into_parts();

    let percent: Vec<bool> = (0..columns.len())
        .map(|i| is_percent_column(rows.iter().filter_map(|r| r.get(i))))
        .collect();
    debug!(
        percent_columns = percent.iter().filter(|p| **p).count(),
        "Parsing percent-formatted columns"
    );

    let rows = rows
        .into_iter()
        .map(|row| {
            columns
                .iter()
                .zip(row)
                .zip(&percent)
                .map(|((col, v), &is_percent)| {
                    let v = if is_percent { parse_percent(v) } else { v };
                    (col.clone(), v)
                })
                .collect::<TickerRow>()
        })
        .collect();

    Snapshot { meta, rows }
}

fn is_percent_column<'a>(values: impl Iterator<Item = &'a Value>) -> bool {
    let mut suffixed = values
        .filter_map(|v| match v {
            Value::Text(s) if s.trim_end().ends_with('%') => Some(s.as_str()),
            _ => None,
        })
        .peekable();
    suffixed.peek().is_some() && suffixed.all(|s| percent_number(s).is_some())
}

fn percent_number(s: &str) -> Option<f64> {
    s.replace('%', "")
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|n| n.is_finite())
}

fn parse_percent(v: Value) -> Value {
    match v {
        Value::Text(s) => percent_number(&s).map(Value::Number).unwrap_or(Value::Null),
        other => other,
    }
}
