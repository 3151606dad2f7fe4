//! In-memory job store and message queue.
//!
//! Both follow the same contracts as the PostgreSQL backends: conditional
//! status writes, visibility timeouts, per-delivery receipts. They back the
//! test suites and single-process local runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::defaults::QUEUE_VISIBILITY_TIMEOUT_SECS;
use crate::error::{Error, Result};
use crate::models::*;
use crate::traits::{JobStore, MessageQueue};

// =============================================================================
// JOB STORE
// =============================================================================

/// Job store backed by a map.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
    unavailable: AtomicBool,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with [`Error::StoreUnavailable`] until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of stored jobs.
    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("in-memory store offline".into()));
        }
        Ok(())
    }

    async fn transition(
        &self,
        id: Uuid,
        apply: impl FnOnce(&mut Job) -> bool,
    ) -> Result<TransitionOutcome> {
        self.check_available()?;
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(Error::JobNotFound(id))?;
        if apply(job) {
            Ok(TransitionOutcome::Applied(job.clone()))
        } else {
            Ok(TransitionOutcome::Rejected(job.clone()))
        }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<()> {
        self.check_available()?;
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&job.id) {
            return Err(Error::InvalidInput(format!("job {} already exists", job.id)));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        self.check_available()?;
        Ok(self.jobs.lock().await.get(&id).cloned())
    }

    async fn claim(&self, id: Uuid) -> Result<ClaimOutcome> {
        self.check_available()?;
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(ClaimOutcome::Missing);
        };
        if job.mark_started() {
            return Ok(ClaimOutcome::Claimed(job.clone()));
        }
        Ok(match job.status {
            JobStatus::Started => ClaimOutcome::InProgress(job.clone()),
            _ => ClaimOutcome::Terminal(job.clone()),
        })
    }

    async fn complete(&self, id: Uuid, artifact_uri: &str) -> Result<TransitionOutcome> {
        self.transition(id, |job| job.mark_done(artifact_uri)).await
    }

    async fn fail(&self, id: Uuid, reason: &str) -> Result<TransitionOutcome> {
        self.transition(id, |job| job.mark_failed(reason)).await
    }

    async fn status_counts(&self) -> Result<JobCounts> {
        self.check_available()?;
        let mut counts = JobCounts::default();
        for job in self.jobs.lock().await.values() {
            counts.add(job.status, 1);
        }
        Ok(counts)
    }
}

// =============================================================================
// MESSAGE QUEUE
// =============================================================================

struct StoredMessage {
    body: String,
    receive_count: u32,
    receipt: Option<String>,
    visible_at: Instant,
}

/// FIFO queue with per-delivery receipts and a visibility timeout.
pub struct InMemoryQueue {
    messages: Mutex<Vec<StoredMessage>>,
    notify: Notify,
    visibility_timeout: Duration,
    send_failing: AtomicBool,
    acks: AtomicUsize,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(QUEUE_VISIBILITY_TIMEOUT_SECS))
    }
}

impl InMemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            notify: Notify::new(),
            visibility_timeout,
            send_failing: AtomicBool::new(false),
            acks: AtomicUsize::new(0),
        }
    }

    /// Make `send` fail with [`Error::Queue`] until reset.
    pub fn set_send_failing(&self, failing: bool) {
        self.send_failing.store(failing, Ordering::SeqCst);
    }

    /// Messages not yet acknowledged, visible or not.
    pub async fn depth(&self) -> usize {
        self.messages.lock().await.len()
    }

    /// Messages currently received and invisible.
    pub async fn in_flight(&self) -> usize {
        let now = Instant::now();
        self.messages
            .lock()
            .await
            .iter()
            .filter(|m| m.receipt.is_some() && m.visible_at > now)
            .count()
    }

    /// Enqueue an arbitrary body, bypassing [`JobMessage`] encoding.
    pub async fn send_raw(&self, body: &str) -> Result<()> {
        if self.send_failing.load(Ordering::SeqCst) {
            return Err(Error::Queue("in-memory queue rejecting sends".into()));
        }
        self.messages.lock().await.push(StoredMessage {
            body: body.to_string(),
            receive_count: 0,
            receipt: None,
            visible_at: Instant::now(),
        });
        self.notify.notify_waiters();
        Ok(())
    }

    /// Number of acks that removed a message.
    pub fn ack_count(&self) -> usize {
        self.acks.load(Ordering::SeqCst)
    }

    /// Make every in-flight message visible again, as if its visibility
    /// timeout had elapsed.
    pub async fn expire_all(&self) {
        let now = Instant::now();
        for message in self.messages.lock().await.iter_mut() {
            message.visible_at = now;
        }
        self.notify.notify_waiters();
    }

    async fn take_visible(&self, max: usize) -> (Vec<Delivery>, Option<Instant>) {
        let now = Instant::now();
        let mut messages = self.messages.lock().await;
        let mut out = Vec::new();
        let mut next_visible: Option<Instant> = None;
        for message in messages.iter_mut() {
            if message.visible_at <= now {
                if out.len() >= max {
                    break;
                }
                let receipt = Uuid::new_v4().to_string();
                message.receive_count += 1;
                message.receipt = Some(receipt.clone());
                message.visible_at = now + self.visibility_timeout;
                out.push(Delivery {
                    receipt,
                    body: message.body.clone(),
                    receive_count: message.receive_count,
                });
            } else {
                next_visible = Some(match next_visible {
                    Some(t) => t.min(message.visible_at),
                    None => message.visible_at,
                });
            }
        }
        (out, next_visible)
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn send(&self, message: &JobMessage) -> Result<()> {
        self.send_raw(&message.encode()?).await
    }

    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (batch, next_visible) = self.take_visible(max).await;
            if !batch.is_empty() {
                return Ok(batch);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let wake_at = next_visible.map_or(deadline, |t| t.min(deadline));
            let _ = tokio::time::timeout_at(wake_at, notified).await;
        }
    }

    async fn ack(&self, receipt: &str) -> Result<()> {
        let mut messages = self.messages.lock().await;
        if let Some(pos) = messages
            .iter()
            .position(|m| m.receipt.as_deref() == Some(receipt))
        {
            messages.remove(pos);
            self.acks.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
