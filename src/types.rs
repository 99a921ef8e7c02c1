use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Cell values
// ---------------------------------------------------------------------------

/// One cell of a fetched or stored table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Number(f64),
    Text(String),
}

impl Value {
    /// Parse one raw CSV field. Empty -> Null, finite number -> Number, else Text.
    pub fn from_field(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Value::Null;
        }
        match trimmed.parse::<f64>() {
            Ok(n) if n.is_finite() => Value::Number(n),
            _ => Value::Text(trimmed.to_string()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Lenient numeric read: numbers pass through, text has every `%` removed
    /// and is parsed. Anything unparseable or non-finite is `None`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Null => None,
            Value::Number(n) => Some(*n).filter(|n| n.is_finite()),
            Value::Text(s) => s
                .replace('%', "")
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|n| n.is_finite()),
        }
    }

    /// Non-empty text content. Numbers are not coerced.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) if !s.is_empty() => Some(s.as_str()),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Number(n) => write!(f, "{n}"),
            Value::Text(s) => write!(f, "{s}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Ticker rows and snapshots
// ---------------------------------------------------------------------------

pub const TICKER: &str = "ticker";
pub const INDUSTRY: &str = "industry";
pub const SECTOR: &str = "sector";
pub const PERFORMANCE_WEEK: &str = "performance_week";
pub const PERFORMANCE_MONTH: &str = "performance_month";
pub const RSI_14: &str = "relative_strength_index_14";
pub const MARKET_CAP: &str = "market_cap";

/// One ticker's canonical-keyed fields for one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TickerRow {
    fields: BTreeMap<String, Value>,
}

impl TickerRow {
    pub fn new(fields: BTreeMap<String, Value>) -> Self {
        Self { fields }
    }

    pub fn ticker(&self) -> Option<&str> {
        self.text(TICKER)
    }

    /// Missing keys read as `Null`, matching the additive-schema rule that
    /// old rows simply lack newer columns.
    pub fn get(&self, key: &str) -> &Value {
        self.fields.get(key).unwrap_or(&Value::Null)
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.get(key).as_str()
    }

    pub fn number(&self, key: &str) -> Option<f64> {
        self.get(key).as_f64()
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.fields.insert(key.into(), value);
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for TickerRow {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// Identity of one pipeline run's output, shared by every row it produced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub snapshot_id: String,
    pub processed_at: DateTime<Utc>,
    pub is_current: bool,
}

/// Immutable output of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub rows: Vec<TickerRow>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupBy {
    Industry,
    Sector,
}

impl GroupBy {
    /// Canonical column the rows are grouped on.
    pub fn column(self) -> &'static str {
        match self {
            GroupBy::Industry => INDUSTRY,
            GroupBy::Sector => SECTOR,
        }
    }
}

impl std::fmt::Display for GroupBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.column())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopStock {
    pub ticker: String,
    pub week: f64,
}

/// Statistics for one industry or sector within one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRow {
    pub snapshot_id: String,
    pub processed_at: DateTime<Utc>,
    pub is_current: bool,
    pub name: String,
    /// Set for industry rows only.
    pub parent_sector: Option<String>,

    // Market-cap weighted
    pub week: Option<f64>,
    pub month: Option<f64>,
    pub rsi: Option<f64>,
    pub momentum: Option<f64>,

    // Equal weighted
    #[serde(rename = "weekEqual")]
    pub week_equal: Option<f64>,
    #[serde(rename = "monthEqual")]
    pub month_equal: Option<f64>,
    #[serde(rename = "rsiEqual")]
    pub rsi_equal: Option<f64>,
    #[serde(rename = "momentumEqual")]
    pub momentum_equal: Option<f64>,

    /// Sum of member market caps in absolute units.
    #[serde(rename = "marketCap")]
    pub market_cap: Option<f64>,
    #[serde(rename = "stockCount")]
    pub stock_count: u64,
    #[serde(rename = "topStocks")]
    pub top_stocks: Vec<TopStock>,
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Append,
    TruncateReplace,
}

impl std::fmt::Display for WriteMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteMode::Append => write!(f, "append"),
            WriteMode::TruncateReplace => write!(f, "truncate_replace"),
        }
    }
}
