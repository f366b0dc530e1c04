use anyhow::{Context, Result};
use appraisal_worker::telemetry::init_telemetry;
use appraisal_worker::{Worker, WorkerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional; real environment variables win
    dotenvy::dotenv().ok();

    // Configure via RUST_LOG or LOG_LEVEL (default: info)
    init_telemetry();

    tracing::info!("appraisal-worker starting...");

    let config = WorkerConfig::from_env().context("Invalid worker configuration")?;
    tracing::info!(
        batch_size = config.dispatcher.batch_size,
        groups = config.group_members.len(),
        "Starting worker"
    );

    let worker = Worker::start(config)
        .await
        .context("Failed to start worker")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    worker.shutdown().await;
    tracing::info!("Worker shutdown complete");
    Ok(())
}
