//! Submission gateway: validates requests, records jobs and enqueues them.
//!
//! The job record is written before the message is sent. If every enqueue
//! attempt fails the caller gets an error and the record stays `submitted`,
//! which readers cannot tell apart from a job that is still queued.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{error, info, warn};
use url::Url;
use uuid::Uuid;

use pagesnap_core::defaults::{ENQUEUE_MAX_ATTEMPTS, ENQUEUE_RETRY_BASE_MS};
use pagesnap_core::{Error, Job, JobCounts, JobMessage, JobStore, MessageQueue, Result};

/// Enqueue retry policy.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Total send attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each later one.
    pub retry_base: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_attempts: ENQUEUE_MAX_ATTEMPTS,
            retry_base: Duration::from_millis(ENQUEUE_RETRY_BASE_MS),
        }
    }
}

impl GatewayConfig {
    /// `ENQUEUE_MAX_ATTEMPTS` (default `3`, at least `1`).
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_attempts: std::env::var("ENQUEUE_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(defaults.max_attempts)
                .max(1),
            ..defaults
        }
    }

    /// Backoff before attempt `attempt + 1`: `retry_base * 2^(attempt-1)`,
    /// jittered down by up to half.
    fn backoff(&self, attempt: u32) -> Duration {
        let ceiling = self
            .retry_base
            .saturating_mul(1u32 << (attempt.saturating_sub(1)).min(16));
        let ceiling_ms = ceiling.as_millis() as u64;
        if ceiling_ms == 0 {
            return Duration::ZERO;
        }
        let jitter = rand::thread_rng().gen_range(0..=ceiling_ms / 2);
        Duration::from_millis(ceiling_ms - jitter)
    }
}

/// Validate and normalize a submitted URI. Returns the trimmed input.
pub fn validate_source_uri(uri: &str) -> Result<String> {
    let trimmed = uri.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidInput("uri is required".to_string()));
    }
    let parsed = Url::parse(trimmed).map_err(|e| {
        Error::InvalidInput(format!("uri must be an absolute http(s) URL: {e}"))
    })?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(Error::InvalidInput(format!(
                "uri scheme `{other}` is not supported, use http or https"
            )))
        }
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(Error::InvalidInput("uri must include a host".to_string()));
    }
    Ok(trimmed.to_string())
}

/// Front door for job creation and status reads.
pub struct SubmissionGateway {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn MessageQueue>,
    config: GatewayConfig,
}

impl SubmissionGateway {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn MessageQueue>) -> Self {
        Self {
            store,
            queue,
            config: GatewayConfig::default(),
        }
    }

    pub fn with_config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    /// Record a `submitted` job for `uri` and enqueue it.
    pub async fn create_job(&self, uri: &str) -> Result<Job> {
        let source_uri = validate_source_uri(uri)?;
        let job = Job::new(source_uri);

        self.store.insert(&job).await?;
        self.enqueue(&JobMessage::for_job(&job)).await?;

        info!(
            subsystem = "api",
            component = "gateway",
            op = "create_job",
            job_id = %job.id,
            uri = %job.source_uri,
            "Job submitted"
        );
        Ok(job)
    }

    /// Current state of a job.
    pub async fn get_job(&self, id: Uuid) -> Result<Job> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Job {id} not found")))
    }

    /// Job counts per status.
    pub async fn stats(&self) -> Result<JobCounts> {
        self.store.status_counts().await
    }

    async fn enqueue(&self, message: &JobMessage) -> Result<()> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.queue.send(message).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < max_attempts => {
                    let delay = self.config.backoff(attempt);
                    warn!(
                        subsystem = "api",
                        component = "gateway",
                        op = "enqueue",
                        job_id = %message.id,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Enqueue failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        subsystem = "api",
                        component = "gateway",
                        op = "enqueue",
                        job_id = %message.id,
                        attempts = attempt,
                        error = %e,
                        "Enqueue failed, job left in submitted state"
                    );
                    return Err(Error::Queue(format!(
                        "could not enqueue job {} after {attempt} attempts: {e}",
                        message.id
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use pagesnap_core::{Delivery, InMemoryJobStore, InMemoryQueue, JobStatus};

    fn gateway() -> (SubmissionGateway, Arc<InMemoryJobStore>, Arc<InMemoryQueue>) {
        let store = Arc::new(InMemoryJobStore::new());
        let queue = Arc::new(InMemoryQueue::default());
        (
            SubmissionGateway::new(store.clone(), queue.clone()),
            store,
            queue,
        )
    }

    #[test]
    fn test_validate_source_uri() {
        assert_eq!(
            validate_source_uri("  https://example.com/page  ").unwrap(),
            "https://example.com/page"
        );
        assert!(validate_source_uri("http://localhost:8080").is_ok());

        for bad in ["", "   ", "example.com", "/relative/path", "ftp://example.com", "mailto:a@b.c"] {
            assert!(
                matches!(validate_source_uri(bad), Err(Error::InvalidInput(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_backoff_grows_and_stays_in_range() {
        let config = GatewayConfig {
            max_attempts: 5,
            retry_base: Duration::from_millis(100),
        };
        for _ in 0..50 {
            let first = config.backoff(1);
            assert!(first >= Duration::from_millis(50) && first <= Duration::from_millis(100));
            let third = config.backoff(3);
            assert!(third >= Duration::from_millis(200) && third <= Duration::from_millis(400));
        }
        let zero = GatewayConfig {
            max_attempts: 1,
            retry_base: Duration::ZERO,
        };
        assert_eq!(zero.backoff(4), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_create_job_writes_record_then_message() {
        let (gateway, store, queue) = gateway();

        let job = gateway.create_job("https://example.com").await.unwrap();

        assert_eq!(job.status, JobStatus::Submitted);
        assert_eq!(store.get(job.id).await.unwrap(), Some(job.clone()));
        let delivery = queue.receive(1, Duration::ZERO).await.unwrap().remove(0);
        assert_eq!(
            delivery.decode().unwrap(),
            JobMessage {
                id: job.id,
                uri: "https://example.com".into()
            }
        );
    }

    #[tokio::test]
    async fn test_rejected_uri_creates_nothing() {
        let (gateway, store, queue) = gateway();

        let err = gateway.create_job("   ").await.unwrap_err();

        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(store.is_empty().await);
        assert_eq!(queue.depth().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_failure_leaves_submitted_record() {
        let (gateway, store, queue) = gateway();
        queue.set_send_failing(true);

        let err = gateway.create_job("https://example.com").await.unwrap_err();

        assert!(matches!(err, Error::Queue(_)));
        assert_eq!(store.len().await, 1);
        assert_eq!(queue.depth().await, 0);
        let counts = gateway.stats().await.unwrap();
        assert_eq!(counts.submitted, 1);
    }

    /// Fails the first `failures` sends, then delegates.
    struct FlakyQueue {
        inner: InMemoryQueue,
        failures: AtomicU32,
    }

    #[async_trait]
    impl MessageQueue for FlakyQueue {
        async fn send(&self, message: &JobMessage) -> Result<()> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(Error::Queue("connection reset".into()));
            }
            self.inner.send(message).await
        }

        async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>> {
            self.inner.receive(max, wait).await
        }

        async fn ack(&self, receipt: &str) -> Result<()> {
            self.inner.ack(receipt).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_enqueue_failure_is_retried() {
        let store = Arc::new(InMemoryJobStore::new());
        let queue = Arc::new(FlakyQueue {
            inner: InMemoryQueue::default(),
            failures: AtomicU32::new(2),
        });
        let gateway = SubmissionGateway::new(store.clone(), queue.clone());

        let job = gateway.create_job("https://example.com").await.unwrap();

        assert_eq!(queue.inner.depth().await, 1);
        assert_eq!(gateway.get_job(job.id).await.unwrap().id, job.id);
    }

    #[tokio::test]
    async fn test_get_unknown_job_is_not_found() {
        let (gateway, _, _) = gateway();
        let err = gateway.get_job(Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
