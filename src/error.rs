use axum::{http::StatusCode, response::IntoResponse};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Structurally broken export. Never retried.
    #[error("Malformed CSV for view '{view}': {reason}")]
    MalformedCsv { view: String, reason: String },

    /// Non-retryable HTTP status (4xx other than 429).
    #[error("Request for view '{view}' rejected with HTTP {status}")]
    Rejected { view: String, status: u16 },

    #[error("Fetch of view '{view}' failed after {attempts} attempts: {reason}")]
    FetchExhausted {
        view: String,
        attempts: u32,
        reason: String,
    },

    #[error("Invalid table name: {0}")]
    InvalidTable(String),

    /// A snapshot row that cannot be stored, e.g. one without a ticker.
    #[error("Invalid row: {0}")]
    InvalidRow(String),

    #[error("Aggregation error: {0}")]
    Aggregation(String),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::InvalidTable(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, format!("Error: {self}")).into_response()
    }
}
