//! pagesnap HTTP API server.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use pagesnap_api::{router, AppState, GatewayConfig, SubmissionGateway};
use pagesnap_core::defaults::API_PORT;
use pagesnap_core::logging::init_tracing;
use pagesnap_db::Database;
use pagesnap_jobs::adapters::{self, ChromiumConfig, ChromiumRenderer};
use pagesnap_jobs::{shutdown_signal, WorkerBuilder, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let _log_guard = init_tracing("pagesnap_api=debug,tower_http=debug");

    let db = Database::connect_from_env().await?;

    let run_migrations = std::env::var("RUN_MIGRATIONS")
        .map(|v| v != "false" && v != "0")
        .unwrap_or(true);
    if run_migrations {
        info!(subsystem = "api", "Running database migrations");
        db.migrate().await?;
    }

    // Single-host mode: run the worker in this process too
    let worker_enabled = std::env::var("WORKER_ENABLED")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);
    let worker_handle = if worker_enabled {
        info!(subsystem = "api", "Starting in-process screenshot worker");
        let handle = WorkerBuilder::new(
            Arc::new(db.jobs.clone()),
            Arc::new(db.queue.clone()),
            Arc::new(ChromiumRenderer::new(ChromiumConfig::from_env())),
            adapters::publisher_from_env()?,
        )
        .with_config(WorkerConfig::from_env().with_enabled(true))
        .with_visibility_timeout(db.queue.config().visibility_timeout)
        .build()
        .start();
        Some(handle)
    } else {
        info!(subsystem = "api", "In-process worker disabled");
        None
    };

    let gateway = SubmissionGateway::new(Arc::new(db.jobs.clone()), Arc::new(db.queue.clone()))
        .with_config(GatewayConfig::from_env());
    let app = router(AppState::new(gateway));

    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(API_PORT);
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!(subsystem = "api", "Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(handle) = worker_handle {
        info!(subsystem = "api", "Draining in-process worker");
        handle.shutdown().await?;
    }
    db.close().await;
    info!(subsystem = "api", "Server stopped");
    Ok(())
}
