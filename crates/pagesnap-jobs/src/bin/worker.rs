//! Standalone screenshot worker.
//!
//! Connects to the job store and queue, then processes messages until
//! SIGTERM or Ctrl-C. In-flight jobs are finished before the process exits.

use std::sync::Arc;

use tracing::info;

use pagesnap_core::logging::init_tracing;
use pagesnap_db::Database;
use pagesnap_jobs::adapters::{self, ChromiumConfig, ChromiumRenderer};
use pagesnap_jobs::{shutdown_signal, WorkerBuilder, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let _log_guard = init_tracing("pagesnap_jobs=debug,pagesnap_db=info");

    let db = Database::connect_from_env().await?;

    let run_migrations = std::env::var("RUN_MIGRATIONS")
        .map(|v| v != "false" && v != "0")
        .unwrap_or(true);
    if run_migrations {
        info!(subsystem = "jobs", component = "main", "Running database migrations");
        db.migrate().await?;
    }

    let renderer = Arc::new(ChromiumRenderer::new(ChromiumConfig::from_env()));
    let publisher = adapters::publisher_from_env()?;
    let config = WorkerConfig::from_env();

    info!(
        subsystem = "jobs",
        component = "main",
        publisher = publisher.name(),
        max_concurrent = config.max_concurrent_jobs,
        "Starting screenshot worker"
    );

    let handle = WorkerBuilder::new(
        Arc::new(db.jobs.clone()),
        Arc::new(db.queue.clone()),
        renderer,
        publisher,
    )
    .with_config(config)
    .with_visibility_timeout(db.queue.config().visibility_timeout)
    .build()
    .start();

    shutdown_signal().await;
    info!(
        subsystem = "jobs",
        component = "main",
        "Shutdown requested, waiting for in-flight jobs"
    );
    handle.shutdown().await?;

    db.close().await;
    info!(subsystem = "jobs", component = "main", "Worker exited");
    Ok(())
}
