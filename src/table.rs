//! Ordered, column-labelled tables as fetched from the screener export.
//!
//! Row order is significant: it is the tie-breaker for top-mover rankings
//! downstream, so every transformation here preserves it.

use serde_json::Map;

use crate::types::Value;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Parse delimited export text. The first record is the header; every
    /// record must have exactly as many fields as the header. The key column,
    /// when present, is always kept as text so tickers like `1234` still join.
    pub fn from_csv(text: &str, key_column: &str) -> csv::Result<Self> {
        let text = text.trim_start_matches('\u{feff}');
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(false)
            .from_reader(text.as_bytes());

        let columns: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        let key_idx = columns.iter().position(|c| c == key_column);

        let mut table = Table::new(columns);
        for record in reader.records() {
            let record = record?;
            let row = record
                .iter()
                .enumerate()
                .map(|(i, field)| {
                    if Some(i) == key_idx {
                        let field = field.trim();
                        if field.is_empty() {
                            Value::Null
                        } else {
                            Value::Text(field.to_string())
                        }
                    } else {
                        Value::from_field(field)
                    }
                })
                .collect();
            table.rows.push(row);
        }
        Ok(table)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Append a row. Short rows are padded with nulls and long rows truncated
    /// so the table stays rectangular.
    pub fn push_row(&mut self, mut row: Vec<Value>) {
        row.resize(self.columns.len(), Value::Null);
        self.rows.push(row);
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    pub(crate) fn into_parts(self) -> (Vec<String>, Vec<Vec<Value>>) {
        (self.columns, self.rows)
    }

    pub(crate) fn from_parts(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        let mut table = Table::new(columns);
        for row in rows {
            table.push_row(row);
        }
        table
    }

    /// Rows as JSON objects keyed by column label, in row order.
    pub fn to_records(&self) -> Vec<Map<String, serde_json::Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .zip(row)
                    .map(|(col, v)| (col.clone(), value_to_json(v)))
                    .collect()
            })
            .collect()
    }
}

fn value_to_json(v: &Value) -> serde_json::Value {
    match v {
        Value::Null => serde_json::Value::Null,
        Value::Number(n) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Text(s) => serde_json::Value::String(s.clone()),
    }
}
