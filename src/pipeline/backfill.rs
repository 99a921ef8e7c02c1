//! Rebuild aggregate history from the full ticker history.
//!
//! Used to initialize or repair the industry and sector tables; never part
//! of a regular run.

use tracing::info;

use crate::config::TableNames;
use crate::db::{HistoryStore, StoredRow};
use crate::error::Result;
use crate::pipeline::aggregate::aggregate_history;
use crate::types::{GroupBy, WriteMode};

pub struct BackfillRunner<S> {
    store: S,
    tables: TableNames,
}

impl<S: HistoryStore> BackfillRunner<S> {
    pub fn new(store: S, tables: TableNames) -> Self {
        Self { store, tables }
    }

    /// Replace the `group_by` aggregate table wholesale with one aggregate
    /// set per `(snapshot_id, is_current)` pair in the ticker history.
    /// Returns the number of aggregate rows written.
    pub async fn rebuild(&self, group_by: GroupBy) -> Result<usize> {
        let source = self.tables.ticker_history();
        let target = self.tables.aggregate_history(group_by);
        info!(source = %source, target = %target, "Rebuilding {group_by} history from {source}");

        let history = self
            .store
            .load_rows(&source, false)
            .await?
            .into_iter()
            .map(|row| -> Result<_> {
                let ticker = row.to_ticker()?;
                Ok((row.meta, ticker))
            })
            .collect::<Result<Vec<_>>>()?;

        let rows = aggregate_history(&history, group_by)?
            .iter()
            .map(StoredRow::from_aggregate)
            .collect::<Result<Vec<_>>>()?;

        self.store
            .append_rows(&target, &rows, WriteMode::TruncateReplace)
            .await?;
        info!(
            target = %target,
            ticker_rows = history.len(),
            rows = rows.len(),
            "Rebuilt {target}: {} rows from {} ticker rows",
            rows.len(),
            history.len(),
        );
        Ok(rows.len())
    }

    /// Industries first, then sectors.
    pub async fn rebuild_all(&self) -> Result<(usize, usize)> {
        let industries = self.rebuild(GroupBy::Industry).await?;
        let sectors = self.rebuild(GroupBy::Sector).await?;
        Ok((industries, sectors))
    }
}
