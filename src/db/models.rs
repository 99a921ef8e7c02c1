//! Row shapes shared by every history table.
//!
//! Each table stores the snapshot stamps as real columns and the row body as
//! a JSON document, so columns that appear in later exports need no schema
//! change: older rows simply lack them.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::{AppError, Result};
use crate::types::{AggregateRow, SnapshotMeta, TickerRow};

#[derive(Debug, sqlx::FromRow)]
pub struct StoredRowRecord {
    pub snapshot_id: String,
    pub processed_at: String,
    pub is_current: bool,
    pub row_key: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub meta: SnapshotMeta,
    /// Ticker for ticker tables, group name for aggregate tables.
    pub key: String,
    pub data: serde_json::Value,
}

impl StoredRow {
    pub fn from_ticker(meta: &SnapshotMeta, row: &TickerRow) -> Result<Self> {
        let key = row.ticker().ok_or_else(|| {
            AppError::InvalidRow(format!("row without ticker in snapshot {}", meta.snapshot_id))
        })?;
        Ok(Self {
            meta: meta.clone(),
            key: key.to_string(),
            data: serde_json::to_value(row)?,
        })
    }

    pub fn from_aggregate(row: &AggregateRow) -> Result<Self> {
        Ok(Self {
            meta: SnapshotMeta {
                snapshot_id: row.snapshot_id.clone(),
                processed_at: row.processed_at,
                is_current: row.is_current,
            },
            key: row.name.clone(),
            data: serde_json::to_value(row)?,
        })
    }

    pub fn to_ticker(&self) -> Result<TickerRow> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// The stamp columns are authoritative: `is_current` may have been
    /// flipped in place after the body was written.
    pub fn to_aggregate(&self) -> Result<AggregateRow> {
        let mut row: AggregateRow = serde_json::from_value(self.data.clone())?;
        row.snapshot_id = self.meta.snapshot_id.clone();
        row.processed_at = self.meta.processed_at;
        row.is_current = self.meta.is_current;
        Ok(row)
    }
}

impl TryFrom<StoredRowRecord> for StoredRow {
    type Error = AppError;

    fn try_from(r: StoredRowRecord) -> Result<Self> {
        Ok(Self {
            meta: SnapshotMeta {
                snapshot_id: r.snapshot_id,
                processed_at: parse_timestamp(&r.processed_at)?,
                is_current: r.is_current,
            },
            key: r.row_key,
            data: serde_json::from_str(&r.data)?,
        })
    }
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::Database(sqlx::Error::Decode(Box::new(e))))
}

/// One snapshot as listed by `/snapshots`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, sqlx::FromRow)]
pub struct SnapshotSummary {
    pub snapshot_id: String,
    pub processed_at: String,
    pub is_current: bool,
    pub rows: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    #[test]
    fn timestamps_round_trip_at_microsecond_precision() {
        let at = DateTime::<Utc>::from_timestamp(1_704_490_200, 123_456_000).unwrap();
        let s = format_timestamp(at);
        assert_eq!(s, "2024-01-05T21:30:00.123456Z");
        assert_eq!(parse_timestamp(&s).unwrap(), at);
    }

    #[test]
    fn ticker_rows_key_on_ticker() {
        let meta = SnapshotMeta {
            snapshot_id: "s1".into(),
            processed_at: DateTime::<Utc>::from_timestamp(0, 0).unwrap(),
            is_current: true,
        };
        let row: TickerRow = [("ticker", Value::Text("A".into()))].into_iter().collect();
        let stored = StoredRow::from_ticker(&meta, &row).unwrap();
        assert_eq!(stored.key, "A");
        assert_eq!(stored.to_ticker().unwrap(), row);
    }

    #[test]
    fn ticker_rows_without_ticker_are_rejected() {
        let meta = SnapshotMeta {
            snapshot_id: "s1".into(),
            processed_at: DateTime::<Utc>::from_timestamp(0, 0).unwrap(),
            is_current: true,
        };
        let row: TickerRow = [("price", Value::Number(190.0))].into_iter().collect();
        let err = StoredRow::from_ticker(&meta, &row).unwrap_err();
        assert!(matches!(err, AppError::InvalidRow(_)), "got {err:?}");
    }

    #[test]
    fn aggregate_stamps_come_from_columns() {
        let row = AggregateRow {
            snapshot_id: "s1".into(),
            processed_at: DateTime::<Utc>::from_timestamp(0, 0).unwrap(),
            is_current: true,
            name: "Technology".into(),
            parent_sector: None,
            week: Some(1.5),
            month: None,
            rsi: None,
            momentum: None,
            week_equal: None,
            month_equal: None,
            rsi_equal: None,
            momentum_equal: None,
            market_cap: Some(3.0e9),
            stock_count: 2,
            top_stocks: Vec::new(),
        };
        let mut stored = StoredRow::from_aggregate(&row).unwrap();
        assert_eq!(stored.key, "Technology");
        assert_eq!(stored.data["marketCap"], serde_json::json!(3.0e9));

        stored.meta.is_current = false;
        let back = stored.to_aggregate().unwrap();
        assert!(!back.is_current);
        assert_eq!(back.week, Some(1.5));
    }
}
