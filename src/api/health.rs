//! Shared run health for the /health endpoint.
//! Updated by the trigger handler after every run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Outcome counters for pipeline runs. Updated by the trigger, read by API.
#[derive(Default)]
pub struct RunHealth {
    pub successes: AtomicU64,
    pub failures: AtomicU64,
    /// Ticker count of the last successful run.
    pub last_tickers: AtomicU64,
    last_run_at: Mutex<Option<DateTime<Utc>>>,
    last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub successes: u64,
    pub failures: u64,
    pub last_tickers: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl RunHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, at: DateTime<Utc>, tickers: usize) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.last_tickers.store(tickers as u64, Ordering::Relaxed);
        *self.last_run_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(at);
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn record_failure(&self, at: DateTime<Utc>, error: &str) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        *self.last_run_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(at);
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error.to_string());
    }

    pub fn report(&self) -> HealthReport {
        let last_error = self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        HealthReport {
            status: if last_error.is_some() { "degraded" } else { "ok" },
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            last_tickers: self.last_tickers.load(Ordering::Relaxed),
            last_run_at: *self.last_run_at.lock().unwrap_or_else(PoisonError::into_inner),
            last_error,
        }
    }
}
