use std::time::Duration;

use tracing::{debug, info};

use crate::config::{Config, ViewSpec, SOURCE_KEY_COLUMN};
use crate::error::{AppError, Result};
use crate::fetcher::retry::{AttemptError, RetryPolicy, RetryReason};
use crate::table::Table;

/// Anything that can produce one named view as a table.
///
/// The pipeline only sees this trait, which keeps it runnable against
/// canned tables in tests.
#[allow(async_fn_in_trait)]
pub trait ViewSource {
    async fn fetch_view(&self, view: &ViewSpec) -> Result<Table>;
}

/// Fetches screener export views over HTTP with bounded retry.
pub struct ViewFetcher {
    client: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
    cap_filter: String,
    policy: RetryPolicy,
}

impl ViewFetcher {
    pub fn new(
        api_url: impl Into<String>,
        api_key: Option<String>,
        cap_filter: impl Into<String>,
        policy: RetryPolicy,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_url: api_url.into(),
            api_key,
            cap_filter: cap_filter.into(),
            policy,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        Self::new(
            cfg.api_url.clone(),
            cfg.api_key.clone(),
            cfg.cap_filter.clone(),
            RetryPolicy::from_config(cfg),
            cfg.request_timeout,
        )
    }

    async fn attempt(
        &self,
        view: &ViewSpec,
        api_key: &str,
        attempt: u32,
    ) -> std::result::Result<Table, AttemptError> {
        info!(
            view = view.name,
            view_id = view.id,
            attempt,
            max_attempts = self.policy.max_attempts(),
            "Fetching view {} (v={}), attempt {attempt}",
            view.name,
            view.id,
        );

        let resp = self
            .client
            .get(&self.api_url)
            .query(&[("v", view.id), ("f", self.cap_filter.as_str()), ("auth", api_key)])
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() || e.is_request() {
                    AttemptError::Retryable(RetryReason::Transport(e.without_url().to_string()))
                } else {
                    AttemptError::Permanent(AppError::Http(e.without_url()))
                }
            })?;

        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| AttemptError::Retryable(RetryReason::Transport(e.without_url().to_string())))?;

        let table = classify_response(view.name, status, &body)?;
        debug!(
            view = view.name,
            rows = table.len(),
            columns = table.columns().len(),
            "Parsed view {}",
            view.name,
        );
        Ok(table)
    }
}

impl ViewSource for ViewFetcher {
    async fn fetch_view(&self, view: &ViewSpec) -> Result<Table> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            AppError::Config("FINVIZ_API_KEY environment variable is not set".to_string())
        })?;
        self.policy
            .run(view.name, |attempt| self.attempt(view, api_key, attempt))
            .await
    }
}

/// Map one HTTP response to a table or a retry decision.
///
/// Retryable: 429, 5xx, empty/whitespace body, zero data rows.
/// Permanent: any other non-2xx status, structurally broken CSV.
pub fn classify_response(
    view: &str,
    status: u16,
    body: &str,
) -> std::result::Result<Table, AttemptError> {
    match status {
        429 => return Err(AttemptError::Retryable(RetryReason::RateLimited)),
        500..=599 => return Err(AttemptError::Retryable(RetryReason::ServerError(status))),
        200..=299 => {}
        _ => {
            return Err(AttemptError::Permanent(AppError::Rejected {
                view: view.to_string(),
                status,
            }))
        }
    }

    if body.trim().is_empty() {
        return Err(AttemptError::Retryable(RetryReason::EmptyBody));
    }

    let table = Table::from_csv(body, SOURCE_KEY_COLUMN).map_err(|e| {
        AttemptError::Permanent(AppError::MalformedCsv {
            view: view.to_string(),
            reason: e.to_string(),
        })
    })?;

    if table.is_empty() {
        return Err(AttemptError::Retryable(RetryReason::NoRows));
    }
    Ok(table)
}
