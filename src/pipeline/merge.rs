//! Combine several views of the export into one row-per-ticker table.
//!
//! Known limitation: when two views carry the same column label, only the
//! first view's values are kept and later ones are dropped. Changing that
//! order would change historical output.

use std::collections::{HashMap, HashSet};

use tracing::{info, warn};

use crate::table::Table;
use crate::types::Value;

pub struct ViewMerger {
    key: String,
}

impl ViewMerger {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    /// Full outer join of `tables` on the key column, in the given order.
    ///
    /// Row order: the seed view's rows first, then tickers first seen in each
    /// later view, in that view's order. Within one view a repeated ticker
    /// keeps its first row; rows without a ticker are dropped.
    pub fn merge(&self, tables: impl IntoIterator<Item = Table>) -> Table {
        let mut columns: Vec<String> = Vec::new();
        let mut rows: Vec<Vec<Value>> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut views = 0usize;

        for table in tables {
            views += 1;
            let (view_columns, view_rows) = table.into_parts();

            if columns.is_empty() {
                columns.push(self.key.clone());
            }

            let Some(key_idx) = view_columns.iter().position(|c| c == &self.key) else {
                warn!(
                    view = views,
                    key = %self.key,
                    "View {views} has no '{}' column; its rows cannot be joined",
                    self.key,
                );
                self.add_columns(&mut columns, &mut rows, &view_columns);
                continue;
            };

            // (position in this view, position in the accumulator)
            let taken = self.add_columns(&mut columns, &mut rows, &view_columns);
            // The key is always the accumulator's first column.
            let acc_key = 0;

            let mut seen_in_view: HashSet<String> = HashSet::new();
            let mut dropped_no_key = 0usize;
            let mut dropped_duplicate = 0usize;

            for mut row in view_rows {
                let Some(ticker) = row.get(key_idx).and_then(Value::as_str).map(str::to_string) else {
                    dropped_no_key += 1;
                    continue;
                };
                if !seen_in_view.insert(ticker.clone()) {
                    dropped_duplicate += 1;
                    continue;
                }

                let target = match index.get(&ticker) {
                    Some(&i) => i,
                    None => {
                        let mut fresh = vec![Value::Null; columns.len()];
                        fresh[acc_key] = Value::Text(ticker.clone());
                        rows.push(fresh);
                        index.insert(ticker, rows.len() - 1);
                        rows.len() - 1
                    }
                };
                for &(from, to) in &taken {
                    if let Some(v) = row.get_mut(from) {
                        rows[target][to] = std::mem::replace(v, Value::Null);
                    }
                }
            }

            if dropped_no_key > 0 || dropped_duplicate > 0 {
                warn!(
                    view = views,
                    dropped_no_key,
                    dropped_duplicate,
                    "Dropped {dropped_no_key} rows without a ticker and {dropped_duplicate} duplicate tickers from view {views}",
                );
            }
        }

        info!(
            views,
            rows = rows.len(),
            columns = columns.len(),
            "Merged {views} views into {} tickers x {} columns",
            rows.len(),
            columns.len(),
        );
        Table::from_parts(columns, rows)
    }

    /// Extend the accumulator with the view's columns it does not have yet,
    /// null-filling existing rows. Returns the mapping of contributed columns.
    fn add_columns(
        &self,
        columns: &mut Vec<String>,
        rows: &mut [Vec<Value>],
        view_columns: &[String],
    ) -> Vec<(usize, usize)> {
        let mut taken = Vec::new();
        for (i, col) in view_columns.iter().enumerate() {
            if col == &self.key {
                continue;
            }
            if columns.iter().any(|c| c == col) {
                continue;
            }
            columns.push(col.clone());
            taken.push((i, columns.len() - 1));
        }
        let width = columns.len();
        for row in rows.iter_mut() {
            row.resize(width, Value::Null);
        }
        taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(csv: &str) -> Table {
        Table::from_csv(csv, "Ticker").unwrap()
    }

    fn merger() -> ViewMerger {
        ViewMerger::new("Ticker")
    }

    fn tickers(t: &Table) -> Vec<String> {
        (0..t.len())
            .map(|i| t.value(i, "Ticker").unwrap().to_string())
            .collect()
    }

    #[test]
    fn first_view_wins_column_collision() {
        let merged = merger().merge(vec![
            table("Ticker,Price\nAAPL,190\n"),
            table("Ticker,Price,P/E\nAAPL,999,30\n"),
        ]);
        assert_eq!(merged.columns(), ["Ticker", "Price", "P/E"]);
        assert_eq!(merged.value(0, "Price"), Some(&Value::Number(190.0)));
        assert_eq!(merged.value(0, "P/E"), Some(&Value::Number(30.0)));
    }

    #[test]
    fn outer_join_keeps_single_view_tickers() {
        let merged = merger().merge(vec![
            table("Ticker,Sector\nAAPL,Technology\n"),
            table("Ticker,Perf Week\nMSFT,1.2%\n"),
        ]);
        assert_eq!(tickers(&merged), ["AAPL", "MSFT"]);
        assert_eq!(merged.value(0, "Perf Week"), Some(&Value::Null));
        assert_eq!(merged.value(1, "Sector"), Some(&Value::Null));
        assert_eq!(merged.value(1, "Perf Week"), Some(&Value::Text("1.2%".into())));
    }

    #[test]
    fn three_views_cover_union_of_tickers() {
        let merged = merger().merge(vec![
            table("Ticker,Company,Price\nA,Alpha,10\nB,Beta,20\n"),
            table("Ticker,Price,Market Cap\nA,11,100\nB,21,200\nC,31,300\n"),
            table("Ticker,Company,Perf Week\nB,Bogus,1%\nC,Gamma,2%\n"),
        ]);
        assert_eq!(tickers(&merged), ["A", "B", "C"]);
        assert_eq!(merged.columns(), ["Ticker", "Company", "Price", "Market Cap", "Perf Week"]);
        // B keeps the first view's Company and Price
        assert_eq!(merged.value(1, "Company"), Some(&Value::Text("Beta".into())));
        assert_eq!(merged.value(1, "Price"), Some(&Value::Number(20.0)));
        // Price and Company belong to view 1's columns; C was absent there and
        // later views cannot refill them.
        assert_eq!(merged.value(2, "Price"), Some(&Value::Null));
        assert_eq!(merged.value(2, "Market Cap"), Some(&Value::Number(300.0)));
        assert_eq!(merged.value(2, "Company"), Some(&Value::Null));
    }

    #[test]
    fn drops_keyless_and_duplicate_rows() {
        let merged = merger().merge(vec![table("Ticker,Price\nA,1\n,2\nA,3\nB,4\n")]);
        assert_eq!(tickers(&merged), ["A", "B"]);
        assert_eq!(merged.value(0, "Price"), Some(&Value::Number(1.0)));
    }

    #[test]
    fn view_without_key_contributes_null_columns() {
        let merged = merger().merge(vec![
            table("Ticker,Price\nA,1\n"),
            table("Symbol,Beta\nA,1.1\n"),
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.value(0, "Beta"), Some(&Value::Null));
        assert_eq!(merged.value(0, "Symbol"), Some(&Value::Null));
    }

    #[test]
    fn key_column_leads_and_keeps_every_ticker() {
        let merged = merger().merge(vec![
            table("Ticker,Price\nAAPL,190\n"),
            table("Ticker,Price,P/E\nAAPL,999,30\nMSFT,1,2\n"),
        ]);
        assert_eq!(merged.columns(), ["Ticker", "Price", "P/E"]);
        assert_eq!(tickers(&merged), ["AAPL", "MSFT"]);
        assert_eq!(merged.value(0, "P/E"), Some(&Value::Number(30.0)));
        assert_eq!(merged.value(1, "P/E"), Some(&Value::Number(2.0)));
        assert_eq!(merged.value(1, "Price"), Some(&Value::Null));
    }

    #[test]
    fn no_views_is_empty() {
        assert!(merger().merge(Vec::new()).is_empty());
    }
}
