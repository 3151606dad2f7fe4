//! Collaborator traits for the screenshot pipeline.
//!
//! The lifecycle controller only talks to these; concrete backends live in
//! `pagesnap-db` (PostgreSQL store and queue), `pagesnap-jobs` (Chromium
//! renderer, S3 and filesystem publishers) and [`crate::memory`].

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{PublishError, RenderError, Result};
use crate::models::*;

// =============================================================================
// JOB STORE
// =============================================================================

/// Durable keyed storage of job records.
///
/// Every status write is conditional on the current status, so concurrent or
/// repeated attempts on the same job cannot move it backwards or overwrite a
/// terminal outcome.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new `submitted` job.
    async fn insert(&self, job: &Job) -> Result<()>;

    /// Fetch a job by id. `Ok(None)` when no record exists.
    async fn get(&self, id: Uuid) -> Result<Option<Job>>;

    /// Try to move a job `submitted → started`.
    async fn claim(&self, id: Uuid) -> Result<ClaimOutcome>;

    /// Move a `started` job to `done` with its artifact locator.
    ///
    /// Returns [`crate::Error::JobNotFound`] when the record does not exist.
    async fn complete(&self, id: Uuid, artifact_uri: &str) -> Result<TransitionOutcome>;

    /// Move a `started` job to `failed` with a failure reason.
    ///
    /// Returns [`crate::Error::JobNotFound`] when the record does not exist.
    async fn fail(&self, id: Uuid, reason: &str) -> Result<TransitionOutcome>;

    /// Number of jobs per status.
    async fn status_counts(&self) -> Result<JobCounts>;
}

// =============================================================================
// MESSAGE QUEUE
// =============================================================================

/// At-least-once queue of job messages with visibility timeouts.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Enqueue a job message.
    async fn send(&self, message: &JobMessage) -> Result<()>;

    /// Receive up to `max` visible messages, waiting up to `wait` for the
    /// first one. Received messages become invisible until acknowledged or
    /// until the visibility timeout elapses.
    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>>;

    /// Permanently remove a delivered message. Acknowledging a receipt that
    /// is no longer current (already acked, or superseded by a redelivery)
    /// is a no-op.
    async fn ack(&self, receipt: &str) -> Result<()>;
}

// =============================================================================
// RENDERER
// =============================================================================

/// Turns a URI into a full-page raster image.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Render the page at `uri`. Each call uses isolated browser state.
    async fn render(&self, uri: &str) -> std::result::Result<RasterImage, RenderError>;

    /// Short backend name for logs.
    fn name(&self) -> &str;
}

// =============================================================================
// ARTIFACT PUBLISHER
// =============================================================================

/// Stores a rendered image durably and returns its public locator.
///
/// The storage key is derived from the job id, so publishing the same job
/// twice overwrites the same object.
#[async_trait]
pub trait ArtifactPublisher: Send + Sync {
    async fn publish(
        &self,
        job_id: Uuid,
        image: &RasterImage,
    ) -> std::result::Result<ArtifactLocator, PublishError>;

    /// Short backend name for logs.
    fn name(&self) -> &str;
}
