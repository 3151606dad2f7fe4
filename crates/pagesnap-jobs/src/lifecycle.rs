//! Per-message job lifecycle.
//!
//! [`JobLifecycle::handle`] takes one queue delivery from receipt to
//! acknowledgment: claim the job, render, publish, write the terminal state,
//! then ack. The message is acknowledged only after a terminal state is in
//! the store; anything that prevents that leaves it for redelivery.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use pagesnap_core::defaults::{RENDER_TIMEOUT_SECS, WORKER_MAX_ORPHAN_RECEIVES};
use pagesnap_core::{
    ArtifactLocator, ArtifactPublisher, ClaimOutcome, Delivery, Job, JobStatus, JobStore,
    MessageQueue, RenderError, Renderer, TransitionOutcome,
};

use crate::worker::WorkerEvent;

/// Lifecycle tuning.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Upper bound on a single render.
    pub render_timeout: Duration,
    /// Deliveries of a message whose job cannot be found before it is dropped.
    pub max_orphan_receives: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            render_timeout: Duration::from_secs(RENDER_TIMEOUT_SECS),
            max_orphan_receives: WORKER_MAX_ORPHAN_RECEIVES,
        }
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// The job reached `done`; message acknowledged.
    Completed { job_id: Uuid, artifact_uri: String },
    /// The job reached `failed`; message acknowledged.
    Failed { job_id: Uuid, reason: String },
    /// The job was already terminal; message acknowledged, nothing rendered.
    AlreadyTerminal { job_id: Uuid, status: JobStatus },
    /// The message can never be processed; acknowledged and dropped.
    Discarded { reason: String },
    /// No terminal state could be written; message left for redelivery.
    Deferred {
        job_id: Option<Uuid>,
        reason: String,
    },
}

impl Disposition {
    /// Whether the delivery was acknowledged.
    pub fn is_acknowledged(&self) -> bool {
        !matches!(self, Disposition::Deferred { .. })
    }
}

/// Orchestrates a job through its state machine for one delivery.
pub struct JobLifecycle {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn MessageQueue>,
    renderer: Arc<dyn Renderer>,
    publisher: Arc<dyn ArtifactPublisher>,
    config: LifecycleConfig,
    events: Option<broadcast::Sender<WorkerEvent>>,
}

impl JobLifecycle {
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
            config: LifecycleConfig::default(),
            events: None,
        }
    }

    pub fn with_config(mut self, config: LifecycleConfig) -> Self {
        self.config = config;
        self
    }

    /// Broadcast job events on `tx`.
    pub fn with_events(mut self, tx: broadcast::Sender<WorkerEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Process one delivery end to end.
    #[instrument(skip(self, delivery), fields(receive_count = delivery.receive_count))]
    pub async fn handle(&self, delivery: Delivery) -> Disposition {
        let message = match delivery.decode() {
            Ok(message) => message,
            Err(e) => {
                error!(
                    subsystem = "jobs",
                    component = "lifecycle",
                    error = %e,
                    "Dropping undecodable message"
                );
                self.ack(&delivery, None).await;
                return self.discard(format!("undecodable message: {e}"));
            }
        };
        let job_id = message.id;

        let (job, resumed) = match self.store.claim(job_id).await {
            Ok(ClaimOutcome::Claimed(job)) => (job, false),
            Ok(ClaimOutcome::InProgress(job)) => {
                // A previous attempt died before its terminal write.
                info!(
                    subsystem = "jobs",
                    component = "lifecycle",
                    job_id = %job_id,
                    receive_count = delivery.receive_count,
                    "Resuming job left in started state"
                );
                (job, true)
            }
            Ok(ClaimOutcome::Terminal(job)) => {
                debug!(
                    subsystem = "jobs",
                    component = "lifecycle",
                    job_id = %job_id,
                    status = %job.status,
                    "Job already terminal, acknowledging redelivery"
                );
                self.ack(&delivery, Some(job_id)).await;
                self.emit(WorkerEvent::JobSkipped {
                    job_id,
                    status: job.status,
                });
                return Disposition::AlreadyTerminal {
                    job_id,
                    status: job.status,
                };
            }
            Ok(ClaimOutcome::Missing) => return self.handle_orphan(&delivery, job_id).await,
            Err(e) => {
                return self.defer(Some(job_id), format!("claim failed: {e}"));
            }
        };

        self.emit(WorkerEvent::JobStarted { job_id, resumed });
        let start = Instant::now();

        let outcome = self.execute(&job).await;

        let write = match &outcome {
            Ok(locator) => self.store.complete(job_id, locator.as_str()).await,
            Err(reason) => self.store.fail(job_id, reason).await,
        };

        let disposition = match write {
            Err(e) => return self.defer(Some(job_id), format!("terminal write failed: {e}")),
            Ok(TransitionOutcome::Applied(stored)) => match outcome {
                Ok(locator) => {
                    info!(
                        subsystem = "jobs",
                        component = "lifecycle",
                        job_id = %job_id,
                        artifact_uri = %locator,
                        duration_ms = start.elapsed().as_millis() as u64,
                        "Job done"
                    );
                    self.emit(WorkerEvent::JobCompleted {
                        job_id,
                        artifact_uri: locator.to_string(),
                    });
                    Disposition::Completed {
                        job_id,
                        artifact_uri: locator.into_string(),
                    }
                }
                Err(reason) => {
                    warn!(
                        subsystem = "jobs",
                        component = "lifecycle",
                        job_id = %job_id,
                        error = %reason,
                        duration_ms = start.elapsed().as_millis() as u64,
                        "Job failed"
                    );
                    debug_assert_eq!(stored.status, JobStatus::Failed);
                    self.emit(WorkerEvent::JobFailed {
                        job_id,
                        error: reason.clone(),
                    });
                    Disposition::Failed { job_id, reason }
                }
            },
            Ok(TransitionOutcome::Rejected(current)) if current.status.is_terminal() => {
                // A concurrent attempt on the same job finished first.
                info!(
                    subsystem = "jobs",
                    component = "lifecycle",
                    job_id = %job_id,
                    status = %current.status,
                    "Another attempt already finished this job"
                );
                self.emit(WorkerEvent::JobSkipped {
                    job_id,
                    status: current.status,
                });
                Disposition::AlreadyTerminal {
                    job_id,
                    status: current.status,
                }
            }
            Ok(TransitionOutcome::Rejected(current)) => {
                return self.defer(
                    Some(job_id),
                    format!("terminal write rejected in state {}", current.status),
                );
            }
        };

        self.ack(&delivery, Some(job_id)).await;
        disposition
    }

    /// Render and publish. The error is the failure reason to record.
    async fn execute(&self, job: &Job) -> Result<ArtifactLocator, String> {
        let run = async {
            let image = match tokio::time::timeout(
                self.config.render_timeout,
                self.renderer.render(&job.source_uri),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(RenderError::Timeout(self.config.render_timeout)),
            }
            .map_err(|e| e.to_string())?;

            debug!(
                subsystem = "jobs",
                component = "lifecycle",
                job_id = %job.id,
                renderer = self.renderer.name(),
                image_bytes = image.len(),
                "Rendered"
            );

            self.publisher
                .publish(job.id, &image)
                .await
                .map_err(|e| e.to_string())
        };

        match AssertUnwindSafe(run).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let detail = panic_message(panic.as_ref());
                error!(
                    subsystem = "jobs",
                    component = "lifecycle",
                    job_id = %job.id,
                    error = %detail,
                    "Render or publish panicked"
                );
                Err(format!("Unexpected error: {detail}"))
            }
        }
    }

    async fn handle_orphan(&self, delivery: &Delivery, job_id: Uuid) -> Disposition {
        if delivery.receive_count >= self.config.max_orphan_receives {
            error!(
                subsystem = "jobs",
                component = "lifecycle",
                job_id = %job_id,
                receive_count = delivery.receive_count,
                "No job record after repeated deliveries, dropping message"
            );
            self.ack(delivery, Some(job_id)).await;
            return self.discard(format!(
                "job {job_id} not found after {} deliveries",
                delivery.receive_count
            ));
        }
        self.defer(Some(job_id), format!("job {job_id} not found yet"))
    }

    /// Acknowledge; a failed ack is only logged, the redelivery is absorbed later.
    async fn ack(&self, delivery: &Delivery, job_id: Option<Uuid>) {
        if let Err(e) = self.queue.ack(&delivery.receipt).await {
            warn!(
                subsystem = "jobs",
                component = "lifecycle",
                job_id = ?job_id,
                error = %e,
                "Failed to acknowledge message, it will be redelivered"
            );
        }
    }

    fn discard(&self, reason: String) -> Disposition {
        self.emit(WorkerEvent::MessageDiscarded {
            reason: reason.clone(),
        });
        Disposition::Discarded { reason }
    }

    fn defer(&self, job_id: Option<Uuid>, reason: String) -> Disposition {
        warn!(
            subsystem = "jobs",
            component = "lifecycle",
            job_id = ?job_id,
            error = %reason,
            "Leaving message for redelivery"
        );
        self.emit(WorkerEvent::MessageDeferred {
            job_id,
            reason: reason.clone(),
        });
        Disposition::Deferred { job_id, reason }
    }

    fn emit(&self, event: WorkerEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_config_defaults() {
        let config = LifecycleConfig::default();
        assert_eq!(config.render_timeout, Duration::from_secs(60));
        assert_eq!(config.max_orphan_receives, 5);
    }

    #[test]
    fn test_disposition_acknowledged() {
        let id = Uuid::nil();
        assert!(Disposition::Completed {
            job_id: id,
            artifact_uri: "x".into()
        }
        .is_acknowledged());
        assert!(Disposition::Discarded { reason: "x".into() }.is_acknowledged());
        assert!(!Disposition::Deferred {
            job_id: Some(id),
            reason: "x".into()
        }
        .is_acknowledged());
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "panic with non-string payload");
    }
}
