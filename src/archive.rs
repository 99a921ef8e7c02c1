//! Raw export archive: one JSON document per run date.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::info;

use crate::error::Result;
use crate::table::Table;

/// Object-style blob sink keyed by a `/`-separated path.
#[allow(async_fn_in_trait)]
pub trait RawArchive {
    async fn put(&self, path: &str, body: Vec<u8>) -> Result<()>;
}

/// Archive backed by a local directory tree.
#[derive(Debug, Clone)]
pub struct LocalArchive {
    root: PathBuf,
}

impl LocalArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl RawArchive for LocalArchive {
    async fn put(&self, path: &str, body: Vec<u8>) -> Result<()> {
        let target = path
            .split('/')
            .filter(|seg| !seg.is_empty() && *seg != "." && *seg != "..")
            .fold(self.root.clone(), |acc, seg| acc.join(seg));
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = body.len();
        tokio::fs::write(&target, body).await?;
        info!(path = %target.display(), bytes, "Archived raw export to {}", target.display());
        Ok(())
    }
}

/// `YYYY/MM/DD/raw.json` for the run date. A second run on the same day
/// overwrites the first.
pub fn raw_object_path(at: DateTime<Utc>) -> String {
    at.format("%Y/%m/%d/raw.json").to_string()
}

/// Merged table as a JSON array of records.
pub fn encode_records(table: &Table) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&table.to_records())?)
}
