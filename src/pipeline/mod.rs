pub mod aggregate;
pub mod backfill;
pub mod merge;
pub mod normalize;
pub mod snapshot;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::archive::{encode_records, raw_object_path, LocalArchive, RawArchive};
use crate::config::{Config, TableNames, ViewSpec, SOURCE_KEY_COLUMN, VIEWS};
use crate::db::{HistoryStore, SqliteHistoryStore, StoredRow};
use crate::error::Result;
use crate::fetcher::{ViewFetcher, ViewSource};
use crate::types::{GroupBy, Snapshot, WriteMode};

pub use backfill::BackfillRunner;
pub use merge::ViewMerger;

/// The pipeline as wired in production.
pub type LivePipeline = Pipeline<ViewFetcher, SqliteHistoryStore, LocalArchive>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// `None` when no view returned any rows and nothing was written.
    pub snapshot_id: Option<String>,
    pub tickers: usize,
    pub industries: usize,
    pub sectors: usize,
}

/// One screener run: fetch, merge, normalize, snapshot, persist, aggregate.
///
/// Runs must not overlap. The pipeline takes no lock itself; callers
/// serialize invocations.
pub struct Pipeline<V, S, A> {
    source: V,
    store: S,
    archive: A,
    tables: TableNames,
    view_pause: Duration,
    views: Vec<ViewSpec>,
}

impl LivePipeline {
    pub fn from_config(cfg: &Config, store: SqliteHistoryStore) -> Result<Self> {
        Ok(Pipeline::new(
            ViewFetcher::from_config(cfg)?,
            store,
            LocalArchive::new(&cfg.raw_archive_dir),
            cfg.tables.clone(),
            cfg.view_pause,
        ))
    }
}

impl<V: ViewSource, S: HistoryStore, A: RawArchive> Pipeline<V, S, A> {
    pub fn new(source: V, store: S, archive: A, tables: TableNames, view_pause: Duration) -> Self {
        Self {
            source,
            store,
            archive,
            tables,
            view_pause,
            views: VIEWS.to_vec(),
        }
    }

    pub fn with_views(mut self, views: Vec<ViewSpec>) -> Self {
        self.views = views;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn tables(&self) -> &TableNames {
        &self.tables
    }

    pub async fn run(&self, now: DateTime<Utc>) -> Result<RunSummary> {
        info!(views = self.views.len(), "Pipeline run starting");

        // Any view failing permanently aborts before anything is written.
        let mut fetched = Vec::with_capacity(self.views.len());
        for (i, view) in self.views.iter().enumerate() {
            if i > 0 && !self.view_pause.is_zero() {
                tokio::time::sleep(self.view_pause).await;
            }
            let table = self.source.fetch_view(view).await?;
            info!(view = view.name, rows = table.len(), "Fetched view {} ({} rows)", view.name, table.len());
            fetched.push(table);
        }

        let merged = ViewMerger::new(SOURCE_KEY_COLUMN).merge(fetched);
        if merged.is_empty() {
            warn!("No rows fetched from any view; nothing written");
            return Ok(RunSummary::default());
        }
        let table = normalize::normalize(merged);

        self.archive
            .put(&raw_object_path(now), encode_records(&table)?)
            .await?;

        let snap = snapshot::build(table, now);
        let meta = &snap.meta;
        info!(
            snapshot_id = %meta.snapshot_id,
            tickers = snap.len(),
            "Built snapshot {} with {} tickers",
            meta.snapshot_id,
            snap.len(),
        );

        let ticker_rows = snap
            .rows
            .iter()
            .map(|row| StoredRow::from_ticker(meta, row))
            .collect::<Result<Vec<_>>>()?;

        self.store
            .append_rows(&self.tables.daily(meta.processed_at), &ticker_rows, WriteMode::TruncateReplace)
            .await?;

        let history = self.tables.ticker_history();
        self.mark_not_current(&history).await;
        self.store
            .append_rows(&history, &ticker_rows, WriteMode::Append)
            .await?;

        let industries = self.publish_aggregates(&snap, GroupBy::Industry).await?;
        let sectors = self.publish_aggregates(&snap, GroupBy::Sector).await?;

        info!(
            snapshot_id = %meta.snapshot_id,
            tickers = snap.len(),
            industries,
            sectors,
            "Pipeline run complete",
        );
        Ok(RunSummary {
            snapshot_id: Some(meta.snapshot_id.clone()),
            tickers: snap.len(),
            industries,
            sectors,
        })
    }

    async fn publish_aggregates(&self, snap: &Snapshot, group_by: GroupBy) -> Result<usize> {
        let rows = aggregate::aggregate_snapshot(snap, group_by)?
            .iter()
            .map(StoredRow::from_aggregate)
            .collect::<Result<Vec<_>>>()?;

        let table = self.tables.aggregate_history(group_by);
        self.mark_not_current(&table).await;
        self.store.append_rows(&table, &rows, WriteMode::Append).await?;
        Ok(rows.len())
    }

    /// Bookkeeping only; on the first run the table does not exist yet.
    async fn mark_not_current(&self, table: &str) {
        if let Err(e) = self.store.mark_not_current(table).await {
            warn!(table, error = %e, "Could not mark {table} rows not current: {e}");
        }
    }
}
