//! # pagesnap-jobs
//!
//! Screenshot worker for pagesnap.
//!
//! This crate provides:
//! - The per-message job lifecycle (claim, render, publish, terminal write, ack)
//! - A concurrency-bounded worker with graceful drain
//! - A headless Chromium renderer speaking the DevTools protocol
//! - S3 and filesystem artifact publishers
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use pagesnap_db::Database;
//! use pagesnap_jobs::{adapters, ChromiumConfig, ChromiumRenderer, WorkerBuilder, WorkerConfig};
//!
//! let db = Database::connect_from_env().await?;
//!
//! let worker = WorkerBuilder::new(
//!     Arc::new(db.jobs.clone()),
//!     Arc::new(db.queue.clone()),
//!     Arc::new(ChromiumRenderer::new(ChromiumConfig::from_env())),
//!     adapters::publisher_from_env()?,
//! )
//! .with_config(WorkerConfig::from_env())
//! .build();
//!
//! let handle = worker.start();
//! let mut events = handle.events();
//!
//! // Stop fetching, finish in-flight jobs
//! handle.shutdown().await?;
//! ```

pub mod adapters;
pub mod lifecycle;
pub mod signal;
pub mod worker;

// Re-export core types
pub use pagesnap_core::*;

pub use adapters::{
    ChromiumConfig, ChromiumRenderer, Credentials, FilesystemPublisher, S3Config, S3Publisher,
};
pub use lifecycle::{Disposition, JobLifecycle, LifecycleConfig};
pub use signal::shutdown_signal;
pub use worker::{JobWorker, WorkerBuilder, WorkerConfig, WorkerEvent, WorkerHandle};
