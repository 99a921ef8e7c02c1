//! Explicit retry policy for view fetches.
//!
//! The schedule and the retryable/permanent split live here so they can be
//! exercised without a network. Delays grow exponentially from `min_delay`,
//! multiplied by [`BACKOFF_MULTIPLIER`] each time and capped at `max_delay`.

use std::future::Future;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::{Config, BACKOFF_MULTIPLIER, MAX_FETCH_ATTEMPTS};
use crate::error::{AppError, Result};

/// Why an attempt is worth repeating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryReason {
    /// HTTP 429
    RateLimited,
    /// Any HTTP 5xx
    ServerError(u16),
    /// Body empty or whitespace-only
    EmptyBody,
    /// Parsed table had a header but no rows
    NoRows,
    /// Connect failure, timeout, or a body that could not be read
    Transport(String),
}

impl std::fmt::Display for RetryReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryReason::RateLimited => write!(f, "rate limited (HTTP 429)"),
            RetryReason::ServerError(status) => write!(f, "server error (HTTP {status})"),
            RetryReason::EmptyBody => write!(f, "empty response body"),
            RetryReason::NoRows => write!(f, "export contained zero rows"),
            RetryReason::Transport(e) => write!(f, "transport error: {e}"),
        }
    }
}

/// Outcome of one failed attempt.
#[derive(Debug)]
pub enum AttemptError {
    Retryable(RetryReason),
    /// Fails the fetch immediately without consuming retry budget.
    Permanent(AppError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    min_delay: Duration,
    max_delay: Duration,
    multiplier: u32,
}

impl RetryPolicy {
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: MAX_FETCH_ATTEMPTS,
            min_delay,
            max_delay: max_delay.max(min_delay),
            multiplier: BACKOFF_MULTIPLIER,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg.retry_min_delay, cfg.retry_max_delay)
    }

    /// Lower the attempt ceiling. Values are clamped to `1..=MAX_FETCH_ATTEMPTS`.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.clamp(1, MAX_FETCH_ATTEMPTS);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Sleep before the attempt following failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self.multiplier.checked_pow(exponent).unwrap_or(u32::MAX);
        self.min_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Drive `op` until it succeeds, fails permanently, or the attempt
    /// ceiling is reached. `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, view: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, AttemptError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(view, attempt, "View fetch succeeded after {attempt} attempts");
                    }
                    return Ok(value);
                }
                Err(AttemptError::Permanent(e)) => {
                    error!(view, attempt, error = %e, "View fetch failed permanently: {e}");
                    return Err(e);
                }
                Err(AttemptError::Retryable(reason)) => {
                    if attempt >= self.max_attempts {
                        error!(
                            view,
                            attempt,
                            reason = %reason,
                            "View fetch exhausted {} attempts: {reason}",
                            self.max_attempts,
                        );
                        return Err(AppError::FetchExhausted {
                            view: view.to_string(),
                            attempts: attempt,
                            reason: reason.to_string(),
                        });
                    }
                    let delay = self.delay_after(attempt);
                    warn!(
                        view,
                        attempt,
                        max_attempts = self.max_attempts,
                        reason = %reason,
                        delay_ms = delay.as_millis() as u64,
                        "Attempt {attempt}/{} for view {view} failed: {reason}; retrying in {}ms",
                        self.max_attempts,
                        delay.as_millis(),
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
