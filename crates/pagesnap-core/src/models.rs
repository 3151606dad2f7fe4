//! Job model, state machine and the values exchanged with collaborators.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::defaults::ARTIFACT_EXTENSION;
use crate::error::{Error, RenderError, Result};

// =============================================================================
// JOB STATUS
// =============================================================================

/// Status of a screenshot job.
///
/// Moves only forward: `submitted → started → done | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Submitted,
    Started,
    Done,
    Failed,
}

impl JobStatus {
    /// All statuses in lifecycle order.
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Submitted,
        JobStatus::Started,
        JobStatus::Done,
        JobStatus::Failed,
    ];

    /// Database / wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Submitted => "submitted",
            JobStatus::Started => "started",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    /// `done` and `failed` accept no further writes.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }

    /// Whether `self → next` is an edge of the state machine.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Submitted, JobStatus::Started)
                | (JobStatus::Started, JobStatus::Done)
                | (JobStatus::Started, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "submitted" => Ok(JobStatus::Submitted),
            "started" => Ok(JobStatus::Started),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            other => Err(Error::Serialization(format!("unknown job status: {other}"))),
        }
    }
}

// =============================================================================
// JOB
// =============================================================================

/// A screenshot request and its outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub source_uri: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new `submitted` job with a time-ordered id.
    pub fn new(source_uri: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            source_uri: source_uri.into(),
            status: JobStatus::Submitted,
            artifact_uri: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// `submitted → started`. Returns false and leaves the job untouched otherwise.
    pub fn mark_started(&mut self) -> bool {
        if !self.status.can_transition_to(JobStatus::Started) {
            return false;
        }
        self.status = JobStatus::Started;
        self.updated_at = Utc::now();
        true
    }

    /// `started → done`, recording the artifact locator.
    pub fn mark_done(&mut self, artifact_uri: impl Into<String>) -> bool {
        if !self.status.can_transition_to(JobStatus::Done) {
            return false;
        }
        self.status = JobStatus::Done;
        self.artifact_uri = Some(artifact_uri.into());
        self.updated_at = Utc::now();
        true
    }

    /// `started → failed`, recording the failure reason.
    pub fn mark_failed(&mut self, reason: impl Into<String>) -> bool {
        if !self.status.can_transition_to(JobStatus::Failed) {
            return false;
        }
        self.status = JobStatus::Failed;
        self.failure_reason = Some(reason.into());
        self.updated_at = Utc::now();
        true
    }

    /// Check the outcome-field invariant: exactly one of artifact/reason once
    /// terminal, neither before.
    pub fn is_consistent(&self) -> bool {
        match self.status {
            JobStatus::Submitted | JobStatus::Started => {
                self.artifact_uri.is_none() && self.failure_reason.is_none()
            }
            JobStatus::Done => self.artifact_uri.is_some() && self.failure_reason.is_none(),
            JobStatus::Failed => self.artifact_uri.is_none() && self.failure_reason.is_some(),
        }
    }
}

/// Storage key of a job's artifact: `{job_id}.png`.
pub fn artifact_key(job_id: Uuid) -> String {
    format!("{}.{}", job_id, ARTIFACT_EXTENSION)
}

/// Result of trying to claim a job for processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The job moved `submitted → started`; this attempt owns it.
    Claimed(Job),
    /// The job is already `started` (another attempt, or a crashed one).
    InProgress(Job),
    /// The job is already `done` or `failed`.
    Terminal(Job),
    /// No record with that id is visible.
    Missing,
}

/// Result of a conditional terminal write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The write landed; the job as stored afterwards.
    Applied(Job),
    /// The job was not in a state that permits the write; the job as stored.
    Rejected(Job),
}

impl TransitionOutcome {
    /// The stored job, whichever way the write went.
    pub fn job(&self) -> &Job {
        match self {
            TransitionOutcome::Applied(job) | TransitionOutcome::Rejected(job) => job,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }
}

/// Number of jobs per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub submitted: i64,
    pub started: i64,
    pub done: i64,
    pub failed: i64,
}

impl JobCounts {
    pub fn total(&self) -> i64 {
        self.submitted + self.started + self.done + self.failed
    }

    /// Count for a single status.
    pub fn get(&self, status: JobStatus) -> i64 {
        match status {
            JobStatus::Submitted => self.submitted,
            JobStatus::Started => self.started,
            JobStatus::Done => self.done,
            JobStatus::Failed => self.failed,
        }
    }

    /// Increment the count for a status.
    pub fn add(&mut self, status: JobStatus, n: i64) {
        match status {
            JobStatus::Submitted => self.submitted += n,
            JobStatus::Started => self.started += n,
            JobStatus::Done => self.done += n,
            JobStatus::Failed => self.failed += n,
        }
    }
}

// =============================================================================
// QUEUE
// =============================================================================

/// Body of the queue message produced once per job by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    pub id: Uuid,
    pub uri: String,
}

impl JobMessage {
    pub fn for_job(job: &Job) -> Self {
        Self {
            id: job.id,
            uri: job.source_uri.clone(),
        }
    }

    /// Encode as the JSON message body.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// One delivery of a queue message to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Handle used to acknowledge this delivery. A redelivery gets a new one.
    pub receipt: String,
    /// Raw message body.
    pub body: String,
    /// How many times the message has been delivered, this one included.
    pub receive_count: u32,
}

impl Delivery {
    /// Decode the body as a [`JobMessage`].
    pub fn decode(&self) -> Result<JobMessage> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

// =============================================================================
// RENDERING / ARTIFACTS
// =============================================================================

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// A captured full-page PNG.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterImage {
    /// Encoded PNG bytes.
    pub data: Vec<u8>,
    /// Width in pixels, from the IHDR chunk.
    pub width: u32,
    /// Height in pixels, from the IHDR chunk.
    pub height: u32,
}

impl RasterImage {
    /// Wrap PNG bytes, validating the signature and reading the dimensions.
    pub fn from_png(data: Vec<u8>) -> std::result::Result<Self, RenderError> {
        if data.len() < 24 {
            return Err(RenderError::InvalidImage(format!(
                "buffer too short for a PNG header ({} bytes)",
                data.len()
            )));
        }
        if data[..8] != PNG_SIGNATURE {
            return Err(RenderError::InvalidImage("missing PNG signature".into()));
        }
        if &data[12..16] != b"IHDR" {
            return Err(RenderError::InvalidImage("first chunk is not IHDR".into()));
        }
        let width = u32::from_be_bytes([data[16], data[17], data[18], data[19]]);
        let height = u32::from_be_bytes([data[20], data[21], data[22], data[23]]);
        Ok(Self {
            data,
            width,
            height,
        })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Durable, publicly resolvable location of a published artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactLocator(String);

impl ArtifactLocator {
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ArtifactLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_transitions_follow_state_machine() {
        use JobStatus::*;
        assert!(Submitted.can_transition_to(Started));
        assert!(Started.can_transition_to(Done));
        assert!(Started.can_transition_to(Failed));

        assert!(!Submitted.can_transition_to(Done));
        assert!(!Submitted.can_transition_to(Failed));
        assert!(!Started.can_transition_to(Submitted));
        assert!(!Started.can_transition_to(Started));
        for terminal in [Done, Failed] {
            for next in JobStatus::ALL {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_status_terminal() {
        assert!(!JobStatus::Submitted.is_terminal());
        assert!(!JobStatus::Started.is_terminal());
        assert!(JobStatus::Done.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn test_status_str_roundtrip() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("pending".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_new_job_is_submitted_and_consistent() {
        let job = Job::new("https://example.com");
        assert_eq!(job.status, JobStatus::Submitted);
        assert_eq!(job.source_uri, "https://example.com");
        assert!(job.artifact_uri.is_none());
        assert!(job.failure_reason.is_none());
        assert!(job.is_consistent());
    }

    #[test]
    fn test_job_ids_are_unique() {
        let a = Job::new("https://a.example");
        let b = Job::new("https://b.example");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_done_path_sets_only_artifact() {
        let mut job = Job::new("https://example.com");
        assert!(job.mark_started());
        assert!(job.is_consistent());
        assert!(job.mark_done("https://objectstore/x.png"));
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.artifact_uri.as_deref(), Some("https://objectstore/x.png"));
        assert!(job.failure_reason.is_none());
        assert!(job.is_consistent());
    }

    #[test]
    fn test_terminal_job_rejects_further_writes() {
        let mut job = Job::new("https://example.com");
        job.mark_started();
        job.mark_failed("boom");
        let snapshot = job.clone();

        assert!(!job.mark_started());
        assert!(!job.mark_done("https://objectstore/x.png"));
        assert!(!job.mark_failed("again"));
        assert_eq!(job, snapshot);
    }

    #[test]
    fn test_cannot_finish_without_starting() {
        let mut job = Job::new("https://example.com");
        assert!(!job.mark_done("https://objectstore/x.png"));
        assert!(!job.mark_failed("nope"));
        assert_eq!(job.status, JobStatus::Submitted);
    }

    #[test]
    fn test_job_json_shape() {
        let mut job = Job::new("https://example.com");
        job.mark_started();
        job.mark_done("https://objectstore/a.png");

        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["status"], "done");
        assert_eq!(value["sourceUri"], "https://example.com");
        assert_eq!(value["artifactUri"], "https://objectstore/a.png");
        assert!(value.get("failureReason").is_none());
        assert_eq!(value["id"], json!(job.id.to_string()));
    }

    #[test]
    fn test_artifact_key_is_id_png() {
        let id = Uuid::nil();
        assert_eq!(
            artifact_key(id),
            "00000000-0000-0000-0000-000000000000.png"
        );
    }

    #[test]
    fn test_job_message_wire_format() {
        let id = Uuid::now_v7();
        let msg = JobMessage {
            id,
            uri: "https://example.com".to_string(),
        };
        let body = msg.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value, json!({ "id": id.to_string(), "uri": "https://example.com" }));
    }

    #[test]
    fn test_delivery_decode_rejects_garbage() {
        let delivery = Delivery {
            receipt: "r".into(),
            body: "{\"id\": 42}".into(),
            receive_count: 1,
        };
        assert!(matches!(delivery.decode(), Err(Error::Serialization(_))));
    }

    #[test]
    fn test_raster_image_reads_dimensions() {
        let image = RasterImage::from_png(test_png::png_bytes(2560, 4800)).unwrap();
        assert_eq!(image.width, 2560);
        assert_eq!(image.height, 4800);
        assert!(!image.is_empty());
    }

    #[test]
    fn test_raster_image_rejects_non_png() {
        let err = RasterImage::from_png(b"GIF89a-not-a-png-at-all-really".to_vec()).unwrap_err();
        assert!(matches!(err, RenderError::InvalidImage(_)));

        let err = RasterImage::from_png(Vec::new()).unwrap_err();
        assert!(matches!(err, RenderError::InvalidImage(_)));
    }

    #[test]
    fn test_job_counts() {
        let mut counts = JobCounts::default();
        counts.add(JobStatus::Done, 2);
        counts.add(JobStatus::Failed, 1);
        assert_eq!(counts.get(JobStatus::Done), 2);
        assert_eq!(counts.total(), 3);
    }
}
