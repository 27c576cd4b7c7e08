mod config;
mod db;
mod error;
mod fetcher;
mod pipeline;
mod transform;
mod types;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::db::SqliteWarehouse;
use crate::error::Result;
use crate::fetcher::AnalyticsClient;
use crate::pipeline::{Pipeline, PipelineSettings};
use crate::types::RunResult;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // A missing .env is fine; real deployments set the environment directly.
    dotenvy::dotenv().ok();

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

    match run(cfg).await {
        Ok(result) => println!("{}", result.total_rows_written),
        Err(e) => {
            error!("Fatal error: {e}");
            std::process::exit(1);
        }
    }
}

async fn run(cfg: Config) -> Result<RunResult> {
    // --- Collaborators: built once, handed to the pipeline ---
    let source = AnalyticsClient::connect(&cfg.api_url, &cfg.auth).await?;
    let warehouse = SqliteWarehouse::connect(&cfg.warehouse, cfg.auto_create).await?;

    info!(
        "Loading property {} | {} → {} | dims: {} | metrics: {} | page size: {} | into {} ({:?}, on error: {:?})",
        cfg.report.property_id,
        cfg.start_date,
        cfg.end_date,
        cfg.report.dimensions.join(","),
        cfg.report.metrics.join(","),
        cfg.report.page_size,
        cfg.destination,
        cfg.granularity,
        cfg.on_day_error,
    );

    let pipeline = Pipeline::new(source, warehouse, PipelineSettings::from_config(&cfg));
    pipeline.run().await
}
