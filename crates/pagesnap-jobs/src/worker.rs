//! Screenshot worker: pulls deliveries off the queue and runs each through
//! the job lifecycle, at most `max_concurrent_jobs` at a time.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use pagesnap_core::defaults::{
    EVENT_BUS_CAPACITY, QUEUE_POLL_INTERVAL_MS, QUEUE_WAIT_SECS, RENDER_TIMEOUT_SECS,
    WORKER_MAX_CONCURRENT, WORKER_MAX_ORPHAN_RECEIVES,
};
use pagesnap_core::{
    ArtifactPublisher, Error, JobStatus, JobStore, MessageQueue, Renderer, Result,
};

use crate::lifecycle::{JobLifecycle, LifecycleConfig};

/// Configuration for the screenshot worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Back-off in milliseconds after an empty or failed receive.
    pub poll_interval_ms: u64,
    /// Maximum number of jobs processed at once.
    pub max_concurrent_jobs: usize,
    /// Whether to process jobs at all.
    pub enabled: bool,
    /// Long-poll wait per receive, in seconds.
    pub queue_wait_secs: u64,
    /// Render timeout in seconds.
    pub render_timeout_secs: u64,
    /// Deliveries of a message without a job record before it is dropped.
    pub max_orphan_receives: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: QUEUE_POLL_INTERVAL_MS,
            max_concurrent_jobs: WORKER_MAX_CONCURRENT,
            enabled: true,
            queue_wait_secs: QUEUE_WAIT_SECS,
            render_timeout_secs: RENDER_TIMEOUT_SECS,
            max_orphan_receives: WORKER_MAX_ORPHAN_RECEIVES,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `WORKER_ENABLED` | `true` | Enable/disable job processing |
    /// | `WORKER_MAX_CONCURRENT` | `3` | Max jobs in flight |
    /// | `QUEUE_POLL_INTERVAL_MS` | `500` | Back-off after an empty poll |
    /// | `QUEUE_WAIT_SECS` | `20` | Long-poll wait per receive |
    /// | `RENDER_TIMEOUT_SECS` | `60` | Render time budget |
    /// | `WORKER_MAX_ORPHAN_RECEIVES` | `5` | Deliveries before an orphan message is dropped |
    pub fn from_env() -> Self {
        let enabled = std::env::var("WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        Self {
            poll_interval_ms: env_parse("QUEUE_POLL_INTERVAL_MS", QUEUE_POLL_INTERVAL_MS),
            max_concurrent_jobs: env_parse("WORKER_MAX_CONCURRENT", WORKER_MAX_CONCURRENT).max(1),
            enabled,
            queue_wait_secs: env_parse("QUEUE_WAIT_SECS", QUEUE_WAIT_SECS),
            render_timeout_secs: env_parse("RENDER_TIMEOUT_SECS", RENDER_TIMEOUT_SECS).max(1),
            max_orphan_receives: env_parse("WORKER_MAX_ORPHAN_RECEIVES", WORKER_MAX_ORPHAN_RECEIVES)
                .max(1),
        }
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set maximum concurrent jobs (at least one).
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max.max(1);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_queue_wait(mut self, secs: u64) -> Self {
        self.queue_wait_secs = secs;
        self
    }

    pub fn with_render_timeout(mut self, secs: u64) -> Self {
        self.render_timeout_secs = secs;
        self
    }

    pub fn with_max_orphan_receives(mut self, receives: u32) -> Self {
        self.max_orphan_receives = receives.max(1);
        self
    }

    pub fn render_timeout(&self) -> Duration {
        Duration::from_secs(self.render_timeout_secs)
    }

    fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            render_timeout: self.render_timeout(),
            max_orphan_receives: self.max_orphan_receives,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Event emitted by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// A job was claimed (or resumed) and is being rendered.
    JobStarted { job_id: Uuid, resumed: bool },
    /// A job reached `done`.
    JobCompleted { job_id: Uuid, artifact_uri: String },
    /// A job reached `failed`.
    JobFailed { job_id: Uuid, error: String },
    /// A redelivered message for an already terminal job was acknowledged.
    JobSkipped { job_id: Uuid, status: JobStatus },
    /// A message that can never be processed was dropped.
    MessageDiscarded { reason: String },
    /// A message was left for redelivery.
    MessageDeferred { job_id: Option<Uuid>, reason: String },
    /// Worker started.
    WorkerStarted,
    /// Worker stopped.
    WorkerStopped,
}

/// Handle for controlling a running worker.
///
/// Dropping the handle also stops the worker.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Stop fetching messages, wait for in-flight jobs to finish, then return.
    pub async fn shutdown(self) -> Result<()> {
        // Already stopped if the receiver is gone.
        let _ = self.shutdown_tx.send(()).await;
        self.join
            .await
            .map_err(|e| Error::Internal(format!("Worker task failed: {e}")))
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Worker that feeds queue deliveries to the job lifecycle.
pub struct JobWorker {
    queue: Arc<dyn MessageQueue>,
    lifecycle: Arc<JobLifecycle>,
    config: WorkerConfig,
    visibility_timeout: Option<Duration>,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl JobWorker {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn MessageQueue>,
        renderer: Arc<dyn Renderer>,
        publisher: Arc<dyn ArtifactPublisher>,
        config: WorkerConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let lifecycle = JobLifecycle::new(store, queue.clone(), renderer, publisher)
            .with_config(config.lifecycle_config())
            .with_events(event_tx.clone());
        Self {
            queue,
            lifecycle: Arc::new(lifecycle),
            config,
            visibility_timeout: None,
            event_tx,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Start the worker and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        let join = tokio::spawn(async move {
            self.run(&mut shutdown_rx).await;
        });

        WorkerHandle {
            shutdown_tx,
            event_rx,
            join,
        }
    }

    /// Receive as many deliveries as there are free slots and process each
    /// in its own task. On shutdown, stop receiving and drain in-flight tasks.
    #[instrument(skip(self, shutdown_rx))]
    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!(subsystem = "jobs", component = "worker", "Worker is disabled, not starting");
            return;
        }

        let max_concurrent = self.config.max_concurrent_jobs.max(1);
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let queue_wait = Duration::from_secs(self.config.queue_wait_secs);

        if let Some(visibility) = self.visibility_timeout {
            if visibility <= self.config.render_timeout() {
                warn!(
                    subsystem = "jobs",
                    component = "worker",
                    visibility_timeout_secs = visibility.as_secs(),
                    render_timeout_secs = self.config.render_timeout_secs,
                    "Queue visibility timeout does not exceed the render timeout; \
                     messages may be redelivered while still being processed"
                );
            }
        }

        info!(
            subsystem = "jobs",
            component = "worker",
            poll_interval_ms = self.config.poll_interval_ms,
            max_concurrent,
            queue_wait_secs = self.config.queue_wait_secs,
            render_timeout_secs = self.config.render_timeout_secs,
            "Worker started"
        );
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

        let slots = Arc::new(Semaphore::new(max_concurrent));
        let mut tasks = JoinSet::new();

        loop {
            while let Some(result) = tasks.try_join_next() {
                if let Err(e) = result {
                    error!(subsystem = "jobs", component = "worker", error = ?e, "Job task panicked");
                }
            }

            // Wait for at least one free slot, then take any others that are free.
            let first = tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let mut permits = vec![first];
            while permits.len() < max_concurrent {
                match slots.clone().try_acquire_owned() {
                    Ok(permit) => permits.push(permit),
                    Err(_) => break,
                }
            }

            let received = tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                received = self.queue.receive(permits.len(), queue_wait) => received,
            };

            match received {
                Ok(deliveries) if !deliveries.is_empty() => {
                    debug!(
                        subsystem = "jobs",
                        component = "worker",
                        received = deliveries.len(),
                        in_flight = tasks.len() + deliveries.len(),
                        "Dispatching deliveries"
                    );
                    for (delivery, permit) in deliveries.into_iter().zip(permits) {
                        let lifecycle = self.lifecycle.clone();
                        tasks.spawn(async move {
                            lifecycle.handle(delivery).await;
                            drop(permit);
                        });
                    }
                }
                Ok(_) => {
                    drop(permits);
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = sleep(poll_interval) => {}
                    }
                }
                Err(e) => {
                    drop(permits);
                    error!(subsystem = "jobs", component = "worker", error = %e, "Queue receive failed");
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = sleep(poll_interval) => {}
                    }
                }
            }
        }

        info!(
            subsystem = "jobs",
            component = "worker",
            in_flight = tasks.len(),
            "Worker received shutdown signal, draining in-flight jobs"
        );
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(subsystem = "jobs", component = "worker", error = ?e, "Job task panicked");
            }
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!(subsystem = "jobs", component = "worker", "Worker stopped");
    }
}

/// Builder for a screenshot worker.
pub struct WorkerBuilder {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn MessageQueue>,
    renderer: Arc<dyn Renderer>,
    publisher: Arc<dyn ArtifactPublisher>,
    config: WorkerConfig,
    visibility_timeout: Option<Duration>,
}

impl WorkerBuilder {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn MessageQueue>,
        renderer: Arc<dyn Renderer>,
        publisher: Arc<dyn ArtifactPublisher>,
    ) -> Self {
        Self {
            store,
            queue,
            renderer,
            publisher,
            config: WorkerConfig::default(),
            visibility_timeout: None,
        }
    }

    /// Set the worker configuration.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Queue visibility timeout, checked against the render timeout at startup.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = Some(timeout);
        self
    }

    /// Build and return the worker.
    pub fn build(self) -> JobWorker {
        let mut worker = JobWorker::new(
            self.store,
            self.queue,
            self.renderer,
            self.publisher,
            self.config,
        );
        worker.visibility_timeout = self.visibility_timeout;
        worker
    }
}
