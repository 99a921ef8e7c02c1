use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{AppError, Result};
use crate::types::GroupBy;

pub const FINVIZ_API_URL: &str = "https://elite.finviz.com/export.ashx";

/// Mid-cap and above.
pub const CAP_FILTER: &str = "cap_midover";

/// Hard ceiling on fetch attempts per view, first try included.
pub const MAX_FETCH_ATTEMPTS: u32 = 5;

/// Backoff multiplier between consecutive retries.
pub const BACKOFF_MULTIPLIER: u32 = 2;

/// Join key as it appears in the raw export header.
pub const SOURCE_KEY_COLUMN: &str = "Ticker";

/// One named view of the screener export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewSpec {
    pub name: &'static str,
    pub id: &'static str,
}

/// Declared views, in fetch and merge order. The first view seeds the merge,
/// so its values win every column collision.
pub const VIEWS: &[ViewSpec] = &[
    ViewSpec { name: "overview", id: "111" },
    ViewSpec { name: "valuation", id: "121" },
    ViewSpec { name: "financial", id: "161" },
    ViewSpec { name: "performance", id: "141" },
    ViewSpec { name: "technical", id: "171" },
    ViewSpec { name: "custom", id: "152" },
];

/// Names of the tables one run writes to, all derived from a single base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    pub base: String,
}

impl TableNames {
    pub fn new(base: impl Into<String>) -> Result<Self> {
        let base = base.into();
        validate_table_name(&base)?;
        Ok(Self { base })
    }

    /// Truncate-and-replace table for one calendar day, e.g. `processed_stock_data_20240105`.
    pub fn daily(&self, at: DateTime<Utc>) -> String {
        format!("{}_{}", self.base, at.format("%Y%m%d"))
    }

    pub fn ticker_history(&self) -> String {
        format!("{}_history", self.base)
    }

    pub fn industry_history(&self) -> String {
        format!("{}_industry_history", self.base)
    }

    pub fn sector_history(&self) -> String {
        format!("{}_sector_history", self.base)
    }

    pub fn aggregate_history(&self, group_by: GroupBy) -> String {
        match group_by {
            GroupBy::Industry => self.industry_history(),
            GroupBy::Sector => self.sector_history(),
        }
    }

    /// Daily table for a caller-supplied `YYYYMMDD` date.
    pub fn daily_for(&self, date: &str) -> Result<String> {
        chrono::NaiveDate::parse_from_str(date, "%Y%m%d")
            .ok()
            .filter(|_| date.len() == 8)
            .ok_or_else(|| AppError::InvalidTable(format!("{}_{date}", self.base)))?;
        Ok(format!("{}_{date}", self.base))
    }
}

/// Table names are interpolated into SQL, so only `[A-Za-z0-9_]` is accepted.
pub fn validate_table_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(AppError::InvalidTable(name.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_url: String,
    /// Screener auth token (FINVIZ_API_KEY). Checked when a run starts, not at boot.
    pub api_key: Option<String>,
    pub cap_filter: String,
    pub log_level: String,
    pub db_path: String,
    pub raw_archive_dir: String,
    pub tables: TableNames,
    pub api_port: u16,
    /// Pause between consecutive view fetches (VIEW_PAUSE_MS)
    pub view_pause: Duration,
    /// First backoff delay (RETRY_MIN_DELAY_MS)
    pub retry_min_delay: Duration,
    /// Backoff cap (RETRY_MAX_DELAY_MS)
    pub retry_max_delay: Duration,
    pub request_timeout: Duration,
    /// When set, the trigger requires `Authorization: Bearer <secret>` (CRON_SECRET)
    pub cron_secret: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let retry_min_delay = Duration::from_millis(env_parse("RETRY_MIN_DELAY_MS", 4_000u64)?);
        let retry_max_delay = Duration::from_millis(env_parse("RETRY_MAX_DELAY_MS", 60_000u64)?);
        if retry_max_delay < retry_min_delay {
            return Err(AppError::Config(
                "RETRY_MAX_DELAY_MS must not be below RETRY_MIN_DELAY_MS".to_string(),
            ));
        }

        Ok(Self {
            api_url: std::env::var("FINVIZ_API_URL").unwrap_or_else(|_| FINVIZ_API_URL.to_string()),
            api_key: non_empty_var("FINVIZ_API_KEY"),
            cap_filter: std::env::var("CAP_FILTER").unwrap_or_else(|_| CAP_FILTER.to_string()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "screener.db".to_string()),
            raw_archive_dir: std::env::var("RAW_ARCHIVE_DIR")
                .unwrap_or_else(|_| "raw-archive".to_string()),
            tables: TableNames::new(
                std::env::var("TABLE_BASE").unwrap_or_else(|_| "processed_stock_data".to_string()),
            )?,
            api_port: env_parse("API_PORT", 8080u16)?,
            view_pause: Duration::from_millis(env_parse("VIEW_PAUSE_MS", 1_000u64)?),
            retry_min_delay,
            retry_max_delay,
            request_timeout: Duration::from_secs(env_parse("REQUEST_TIMEOUT_SECS", 30u64)?),
            cron_secret: non_empty_var("CRON_SECRET"),
        })
    }

    /// SQLite connection string; `mode=rwc` creates the file on first boot.
    pub fn database_url(&self) -> String {
        format!("sqlite:{}?mode=rwc", self.db_path)
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::Config(format!("{key} has an invalid value: {raw:?}"))),
        Err(_) => Ok(default),
    }
}
