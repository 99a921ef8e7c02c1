//! One-off rebuild of the industry and sector history tables from the full
//! ticker history.
//!
//! Usage: `backfill [industry|sector|all]` (default `all`).

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use screener_pipeline::config::Config;
use screener_pipeline::db::SqliteHistoryStore;
use screener_pipeline::error::{AppError, Result};
use screener_pipeline::pipeline::BackfillRunner;
use screener_pipeline::types::GroupBy;

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

    let target = std::env::args().nth(1).unwrap_or_else(|| "all".to_string());
    if let Err(e) = run(cfg, &target).await {
        error!("Backfill failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config, target: &str) -> Result<()> {
    let store = SqliteHistoryStore::connect(&cfg.database_url()).await?;
    let runner = BackfillRunner::new(store, cfg.tables.clone());

    match target {
        "industry" => {
            let rows = runner.rebuild(GroupBy::Industry).await?;
            info!("Industry history rebuilt: {rows} rows");
        }
        "sector" => {
            let rows = runner.rebuild(GroupBy::Sector).await?;
            info!("Sector history rebuilt: {rows} rows");
        }
        "all" => {
            let (industries, sectors) = runner.rebuild_all().await?;
            info!("Backfill complete: {industries} industry rows, {sectors} sector rows");
        }
        other => {
            return Err(AppError::Config(format!(
                "unknown backfill target {other:?}; expected industry, sector or all"
            )));
        }
    }
    Ok(())
}
