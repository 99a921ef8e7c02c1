pub mod models;
pub mod store;

pub use models::{SnapshotSummary, StoredRow};
pub use store::{HistoryStore, SqliteHistoryStore};
