use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::api::health::{HealthReport, RunHealth};
use crate::archive::RawArchive;
use crate::config::TableNames;
use crate::db::{HistoryStore, SnapshotSummary, SqliteHistoryStore};
use crate::error::{AppError, Result};
use crate::fetcher::ViewSource;
use crate::pipeline::{LivePipeline, Pipeline};
use crate::types::{AggregateRow, GroupBy, TickerRow, TICKER};

#[derive(Clone)]
pub struct ApiState {
    pub pipeline: Arc<LivePipeline>,
    pub store: SqliteHistoryStore,
    pub tables: TableNames,
    /// Bearer token required by the trigger, when set.
    pub cron_secret: Option<String>,
    /// Held for the duration of a run; a second trigger gets 409.
    pub run_lock: Arc<Mutex<()>>,
    pub health: Arc<RunHealth>,
}

impl ApiState {
    pub fn new(pipeline: LivePipeline, store: SqliteHistoryStore, cron_secret: Option<String>) -> Self {
        let tables = pipeline.tables().clone();
        Self {
            pipeline: Arc::new(pipeline),
            store,
            tables,
            cron_secret,
            run_lock: Arc::new(Mutex::new(())),
            health: Arc::new(RunHealth::new()),
        }
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(trigger).post(trigger))
        .route("/run", get(trigger).post(trigger))
        .route("/industries", get(get_industries))
        .route("/sectors", get(get_sectors))
        .route("/snapshots", get(get_snapshots))
        .route("/download/:date", get(download_daily))
        .route("/health", get(get_health))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

async fn trigger(State(state): State<ApiState>, headers: HeaderMap) -> (StatusCode, String) {
    if !authorized(state.cron_secret.as_deref(), &headers) {
        warn!("Rejected trigger with missing or wrong bearer token");
        return (StatusCode::UNAUTHORIZED, "Unauthorized".to_string());
    }
    let Ok(_guard) = state.run_lock.try_lock() else {
        warn!("Trigger received while a run is in progress");
        return (StatusCode::CONFLICT, "A run is already in progress".to_string());
    };
    run_and_report(&state.pipeline, &state.health).await
}

/// With no secret configured every caller is allowed.
pub fn authorized(secret: Option<&str>, headers: &HeaderMap) -> bool {
    let Some(secret) = secret else {
        return true;
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token == secret)
}

/// Run the pipeline once and map the outcome to the trigger's response.
pub async fn run_and_report<V, S, A>(pipeline: &Pipeline<V, S, A>, health: &RunHealth) -> (StatusCode, String)
where
    V: ViewSource,
    S: HistoryStore,
    A: RawArchive,
{
    let started = Utc::now();
    match pipeline.run(started).await {
        Ok(summary) if summary.tickers == 0 => {
            health.record_success(started, 0);
            (StatusCode::OK, "No data fetched".to_string())
        }
        Ok(summary) => {
            health.record_success(started, summary.tickers);
            info!(
                tickers = summary.tickers,
                industries = summary.industries,
                sectors = summary.sectors,
                "Run finished in {}ms",
                (Utc::now() - started).num_milliseconds(),
            );
            (
                StatusCode::OK,
                format!("Successfully processed {} tickers.", summary.tickers),
            )
        }
        Err(e) => {
            error!(error = %e, "Pipeline run failed: {e}");
            health.record_failure(started, &e.to_string());
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {e}"))
        }
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

async fn get_industries(State(state): State<ApiState>) -> Result<Json<Vec<AggregateRow>>> {
    current_aggregates(&state, GroupBy::Industry).await.map(Json)
}

async fn get_sectors(State(state): State<ApiState>) -> Result<Json<Vec<AggregateRow>>> {
    current_aggregates(&state, GroupBy::Sector).await.map(Json)
}

async fn current_aggregates(state: &ApiState, group_by: GroupBy) -> Result<Vec<AggregateRow>> {
    let mut rows = state
        .store
        .load_rows(&state.tables.aggregate_history(group_by), true)
        .await?
        .iter()
        .map(|r| r.to_aggregate())
        .collect::<Result<Vec<_>>>()?;
    sort_by_momentum(&mut rows);
    Ok(rows)
}

/// Weighted momentum descending, nulls last. Ties keep storage order.
pub fn sort_by_momentum(rows: &mut [AggregateRow]) {
    rows.sort_by(|a, b| match (a.momentum, b.momentum) {
        (Some(x), Some(y)) => y.total_cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}

async fn get_snapshots(State(state): State<ApiState>) -> Result<Json<Vec<SnapshotSummary>>> {
    let snapshots = state
        .store
        .list_snapshots(&state.tables.ticker_history())
        .await?;
    Ok(Json(snapshots))
}

async fn download_daily(State(state): State<ApiState>, Path(date): Path<String>) -> Result<Response> {
    let table = state.tables.daily_for(&date)?;
    if !state.store.table_exists(&table).await? {
        return Ok((StatusCode::NOT_FOUND, "File not found").into_response());
    }

    let rows = state
        .store
        .load_rows(&table, false)
        .await?
        .iter()
        .map(|r| r.to_ticker())
        .collect::<Result<Vec<_>>>()?;
    let body = render_csv(&rows)?;

    Ok((
        [
            (header::CONTENT_TYPE, "text/csv".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"screener_export_{date}.csv\""),
            ),
        ],
        body,
    )
        .into_response())
}

/// Ticker first, then every other column seen in any row, alphabetically.
pub fn render_csv(rows: &[TickerRow]) -> Result<Vec<u8>> {
    let others: BTreeSet<&str> = rows
        .iter()
        .flat_map(|r| r.fields().keys().map(String::as_str))
        .filter(|k| *k != TICKER)
        .collect();
    let columns: Vec<&str> = std::iter::once(TICKER).chain(others).collect();

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(&columns)?;
    for row in rows {
        writer.write_record(columns.iter().map(|col| row.get(col).to_string()))?;
    }
    writer
        .into_inner()
        .map_err(|e| AppError::Io(e.into_error()))
}

async fn get_health(State(state): State<ApiState>) -> Json<HealthReport> {
    Json(state.health.report())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::http::HeaderValue;
    use chrono::DateTime;

    use crate::archive::LocalArchive;
    use crate::config::ViewSpec;
    use crate::fetcher::{RetryPolicy, ViewFetcher};
    use crate::table::Table;
    use crate::types::Value;

    #[test]
    fn bearer_token_must_match_secret() {
        let mut headers = HeaderMap::new();
        assert!(authorized(None, &headers));
        assert!(!authorized(Some("s3cret"), &headers));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer wrong"));
        assert!(!authorized(Some("s3cret"), &headers));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer s3cret"));
        assert!(authorized(Some("s3cret"), &headers));
        assert!(authorized(None, &headers));
    }

    fn agg(name: &str, momentum: Option<f64>) -> AggregateRow {
        AggregateRow {
            snapshot_id: "s1".into(),
            processed_at: DateTime::<Utc>::from_timestamp(0, 0).unwrap(),
            is_current: true,
            name: name.into(),
            parent_sector: None,
            week: None,
            month: None,
            rsi: None,
            momentum,
            week_equal: None,
            month_equal: None,
            rsi_equal: None,
            momentum_equal: None,
            market_cap: None,
            stock_count: 1,
            top_stocks: Vec::new(),
        }
    }

    #[test]
    fn momentum_sort_puts_nulls_last() {
        let mut rows = vec![
            agg("a", None),
            agg("b", Some(1.0)),
            agg("c", Some(-3.0)),
            agg("d", Some(7.5)),
            agg("e", None),
        ];
        sort_by_momentum(&mut rows);
        let names: Vec<_> = rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["d", "b", "c", "a", "e"]);
    }

    #[test]
    fn csv_export_puts_ticker_first() {
        let rows: Vec<TickerRow> = vec![
            [
                ("ticker", Value::Text("A".into())),
                ("price", Value::Number(10.5)),
                ("company", Value::Text("Alpha, Inc.".into())),
            ]
            .into_iter()
            .collect(),
            [("ticker", Value::Text("B".into())), ("beta", Value::Number(1.2))]
                .into_iter()
                .collect(),
        ];
        let body = String::from_utf8(render_csv(&rows).unwrap()).unwrap();
        assert_eq!(
            body,
            "ticker,beta,company,price\nA,,\"Alpha, Inc.\",10.5\nB,1.2,,\n"
        );
    }

    struct StaticSource(Option<&'static str>);

    impl ViewSource for StaticSource {
        async fn fetch_view(&self, view: &ViewSpec) -> Result<Table> {
            match self.0 {
                Some(csv) => Ok(Table::from_csv(csv, "Ticker")?),
                None => Err(AppError::FetchExhausted {
                    view: view.name.to_string(),
                    attempts: 5,
                    reason: "HTTP 503".to_string(),
                }),
            }
        }
    }

    async fn report_for(source: StaticSource, health: &RunHealth) -> (StatusCode, String) {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(
            source,
            SqliteHistoryStore::in_memory().await.unwrap(),
            LocalArchive::new(dir.path()),
            TableNames::new("stocks").unwrap(),
            Duration::ZERO,
        )
        .with_views(vec![ViewSpec { name: "overview", id: "111" }]);
        run_and_report(&pipeline, health).await
    }

    #[tokio::test]
    async fn trigger_responses_follow_run_outcome() {
        let health = RunHealth::new();

        let (status, body) =
            report_for(StaticSource(Some("Ticker,Sector\nA,Tech\nB,Energy\n")), &health).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Successfully processed 2 tickers.");

        let (status, body) = report_for(StaticSource(Some("Ticker,Sector\n")), &health).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "No data fetched");

        let (status, body) = report_for(StaticSource(None), &health).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.starts_with("Error: Fetch of view 'overview' failed after 5 attempts"), "{body}");

        let report = health.report();
        assert_eq!(report.successes, 2);
        assert_eq!(report.failures, 1);
    }

    async fn serve(cron_secret: Option<&str>) -> (String, ApiState) {
        let store = SqliteHistoryStore::in_memory().await.unwrap();
        let fetcher = ViewFetcher::new(
            "http://127.0.0.1:9/export",
            None,
            "cap_midover",
            RetryPolicy::new(Duration::ZERO, Duration::ZERO),
            Duration::from_secs(1),
        )
        .unwrap();
        let pipeline = Pipeline::new(
            fetcher,
            store.clone(),
            // Never written: without an API key the run stops at the first fetch.
            LocalArchive::new(std::env::temp_dir()),
            TableNames::new("stocks").unwrap(),
            Duration::ZERO,
        );
        let state = ApiState::new(pipeline, store, cron_secret.map(str::to_string));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state.clone());
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{addr}"), state)
    }

    #[tokio::test]
    async fn trigger_checks_secret_and_overlap() {
        let (base, state) = serve(Some("s3cret")).await;
        let client = reqwest::Client::new();

        let resp = client.post(format!("{base}/run")).send().await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);

        let guard = state.run_lock.lock().await;
        let resp = client
            .post(format!("{base}/run"))
            .bearer_auth("s3cret")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::CONFLICT);
        drop(guard);

        // No API key configured: the run fails before any request is sent.
        let resp = client.get(&base).bearer_auth("s3cret").send().await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
        let body = resp.text().await.unwrap();
        assert!(body.contains("FINVIZ_API_KEY"), "{body}");

        let health: serde_json::Value = client
            .get(format!("{base}/health"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["failures"], 1);
        assert_eq!(health["status"], "degraded");
    }

    #[tokio::test]
    async fn query_endpoints_on_empty_history() {
        let (base, _state) = serve(None).await;
        let client = reqwest::Client::new();

        let industries: Vec<serde_json::Value> = client
            .get(format!("{base}/industries"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(industries.is_empty());

        let resp = client.get(format!("{base}/download/20240105")).send().await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

        let resp = client.get(format!("{base}/download/not-a-date")).send().await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    }
}
