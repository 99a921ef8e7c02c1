//! Canonical column keys: lowercase `[a-z0-9_]`, no leading/trailing or
//! repeated underscores. `"Performance (Week)"` becomes `performance_week`.

use tracing::warn;

use crate::table::Table;
use crate::types::Value;

pub fn normalize_label(label: &str) -> String {
    let replaced: String = label
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let mut out = String::with_capacity(replaced.len());
    for c in replaced.trim_matches('_').chars() {
        if c == '_' && out.ends_with('_') {
            continue;
        }
        out.push(c);
    }
    out
}

/// Rename every column to its canonical key.
///
/// Two labels can collapse onto the same key (`"P/E"` and `"P E"`). The key
/// keeps the position of its first occurrence and the values of the last
/// one. A label with no usable characters becomes `column_<index>`.
pub fn normalize(table: Table) -> Table {
    let (columns, rows) = table.into_parts();

    let mut keys: Vec<String> = Vec::with_capacity(columns.len());
    let mut target: Vec<usize> = Vec::with_capacity(columns.len());
    for (i, label) in columns.iter().enumerate() {
        let mut key = normalize_label(label);
        if key.is_empty() {
            key = format!("column_{i}");
        }
        match keys.iter().position(|k| *k == key) {
            Some(existing) => {
                warn!(
                    label = %label,
                    key = %key,
                    "Column '{label}' normalizes to existing key '{key}'; its values replace the earlier column",
                );
                target.push(existing);
            }
            None => {
                keys.push(key);
                target.push(keys.len() - 1);
            }
        }
    }

    let rows = rows
        .into_iter()
        .map(|row| {
            let mut out = vec![Value::Null; keys.len()];
            for (i, v) in row.into_iter().enumerate() {
                if let Some(&t) = target.get(i) {
                    out[t] = v;
                }
            }
            out
        })
        .collect();

    Table::from_parts(keys, rows)
}
