use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use screener_pipeline::api::{router, ApiState};
use screener_pipeline::config::Config;
use screener_pipeline::db::SqliteHistoryStore;
use screener_pipeline::error::Result;
use screener_pipeline::pipeline::LivePipeline;

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Database setup ---
    let store = SqliteHistoryStore::connect(&cfg.database_url()).await?;
    info!("Database ready at {}", cfg.db_path);

    if cfg.api_key.is_none() {
        warn!("FINVIZ_API_KEY not set; every triggered run will fail until it is");
    }
    if cfg.cron_secret.is_none() {
        warn!("CRON_SECRET not set; the trigger endpoint accepts unauthenticated calls");
    }
    info!(
        views = screener_pipeline::config::VIEWS.len(),
        cap_filter = %cfg.cap_filter,
        history = %cfg.tables.ticker_history(),
        archive = %cfg.raw_archive_dir,
        "Pipeline configured: {} views, filter {}, history table {}",
        screener_pipeline::config::VIEWS.len(),
        cfg.cap_filter,
        cfg.tables.ticker_history(),
    );

    let pipeline = LivePipeline::from_config(&cfg, store.clone())?;

    // --- HTTP API server ---
    let app = router(ApiState::new(pipeline, store, cfg.cron_secret.clone()));
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
