use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use crate::config::validate_table_name;
use crate::db::models::{format_timestamp, SnapshotSummary, StoredRow, StoredRowRecord};
use crate::error::Result;
use crate::types::WriteMode;

/// Append-only history tables with a flippable `is_current` flag.
///
/// `mark_not_current` followed by `append_rows` is two operations, not one:
/// a reader in between can see zero or two current snapshots.
#[allow(async_fn_in_trait)]
pub trait HistoryStore {
    /// Write `rows` to `table`, creating it if needed. Returns rows written.
    async fn append_rows(&self, table: &str, rows: &[StoredRow], mode: WriteMode) -> Result<u64>;

    /// Clear `is_current` on every row of `table` that has it set. Fails if
    /// the table does not exist yet.
    async fn mark_not_current(&self, table: &str) -> Result<u64>;

    /// Rows in insertion order. A table that does not exist reads as empty.
    async fn load_rows(&self, table: &str, current_only: bool) -> Result<Vec<StoredRow>>;
}

#[derive(Debug, Clone)]
pub struct SqliteHistoryStore {
    pool: SqlitePool,
}

impl SqliteHistoryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new().max_connections(5).connect(url).await?;
        Ok(Self::new(pool))
    }

    /// Single-connection in-memory database; the connection is never recycled
    /// so the data lives as long as the store.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn table_exists(&self, table: &str) -> Result<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(table)
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }

    /// Distinct snapshots in `table`, newest first.
    pub async fn list_snapshots(&self, table: &str) -> Result<Vec<SnapshotSummary>> {
        validate_table_name(table)?;
        if !self.table_exists(table).await? {
            return Ok(Vec::new());
        }
        let sql = format!(
            r#"
            SELECT snapshot_id, MAX(processed_at) AS processed_at, is_current, COUNT(*) AS "rows"
            FROM "{table}"
            GROUP BY snapshot_id, is_current
            ORDER BY processed_at DESC
            "#
        );
        Ok(sqlx::query_as::<_, SnapshotSummary>(&sql)
            .fetch_all(&self.pool)
            .await?)
    }
}

impl HistoryStore for SqliteHistoryStore {
    async fn append_rows(&self, table: &str, rows: &[StoredRow], mode: WriteMode) -> Result<u64> {
        validate_table_name(table)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{table}" (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                snapshot_id  TEXT    NOT NULL,
                processed_at TEXT    NOT NULL,
                is_current   INTEGER NOT NULL,
                row_key      TEXT    NOT NULL,
                data         TEXT    NOT NULL
            )
            "#
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            r#"CREATE INDEX IF NOT EXISTS "{table}_is_current" ON "{table}" (is_current)"#
        ))
        .execute(&mut *tx)
        .await?;

        if mode == WriteMode::TruncateReplace {
            let cleared = sqlx::query(&format!(r#"DELETE FROM "{table}""#))
                .execute(&mut *tx)
                .await?
                .rows_affected();
            debug!(table, cleared, "Truncated {table}");
        }

        let insert = format!(
            r#"
            INSERT INTO "{table}" (snapshot_id, processed_at, is_current, row_key, data)
            VALUES (?, ?, ?, ?, ?)
            "#
        );
        for row in rows {
            sqlx::query(&insert)
                .bind(&row.meta.snapshot_id)
                .bind(format_timestamp(row.meta.processed_at))
                .bind(row.meta.is_current)
                .bind(&row.key)
                .bind(serde_json::to_string(&row.data)?)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        info!(table, rows = rows.len(), mode = %mode, "Wrote {} rows to {table} ({mode})", rows.len());
        Ok(rows.len() as u64)
    }

    async fn mark_not_current(&self, table: &str) -> Result<u64> {
        validate_table_name(table)?;
        let flipped = sqlx::query(&format!(
            r#"UPDATE "{table}" SET is_current = 0 WHERE is_current = 1"#
        ))
        .execute(&self.pool)
        .await?
        .rows_affected();
        info!(table, rows = flipped, "Marked {flipped} rows in {table} not current");
        Ok(flipped)
    }

    async fn load_rows(&self, table: &str, current_only: bool) -> Result<Vec<StoredRow>> {
        validate_table_name(table)?;
        if !self.table_exists(table).await? {
            return Ok(Vec::new());
        }
        let filter = if current_only { "WHERE is_current = 1" } else { "" };
        let sql = format!(
            r#"
            SELECT snapshot_id, processed_at, is_current, row_key, data
            FROM "{table}"
            {filter}
            ORDER BY id
            "#
        );
        let records = sqlx::query_as::<_, StoredRowRecord>(&sql)
            .fetch_all(&self.pool)
            .await?;
        records.into_iter().map(StoredRow::try_from).collect()
    }
}
