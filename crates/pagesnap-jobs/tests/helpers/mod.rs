//! Test doubles shared by the worker and lifecycle tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use pagesnap_jobs::{
    ArtifactLocator, ArtifactPublisher, InMemoryJobStore, InMemoryQueue, Job, JobMessage,
    JobStore, MessageQueue, PublishError, RasterImage, RenderError, Renderer,
};

/// Minimal PNG header with the given dimensions.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut data = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    data.extend_from_slice(&13u32.to_be_bytes());
    data.extend_from_slice(b"IHDR");
    data.extend_from_slice(&width.to_be_bytes());
    data.extend_from_slice(&height.to_be_bytes());
    data.extend_from_slice(&[8, 6, 0, 0, 0, 0, 0, 0, 0]);
    data
}

#[derive(Clone)]
enum RenderBehavior {
    Succeed,
    Fail(RenderError),
    Panic,
}

/// Renderer that sleeps, then succeeds, fails or panics, and records how
/// many renders overlapped.
pub struct MockRenderer {
    behavior: RenderBehavior,
    delay: Duration,
    payload: usize,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockRenderer {
    pub fn new() -> Self {
        Self {
            behavior: RenderBehavior::Succeed,
            delay: Duration::ZERO,
            payload: 0,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Pad each image with `len` bytes of the call number (1, 2, ...), so
    /// every render is distinguishable.
    pub fn with_payload(mut self, len: usize) -> Self {
        self.payload = len;
        self
    }

    /// The image the `call`-th render (1-based) returns with a payload set.
    pub fn rendered(&self, call: u8) -> Vec<u8> {
        let mut data = png_bytes(2560, 4000);
        data.extend(std::iter::repeat(call).take(self.payload));
        data
    }

    pub fn failing(mut self, error: RenderError) -> Self {
        self.behavior = RenderBehavior::Fail(error);
        self
    }

    pub fn panicking(mut self) -> Self {
        self.behavior = RenderBehavior::Panic;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Renderer for MockRenderer {
    async fn render(&self, uri: &str) -> Result<RasterImage, RenderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        if uri.is_empty() {
            return Err(RenderError::EmptyUri);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.behavior {
            RenderBehavior::Succeed => RasterImage::from_png(self.rendered(call as u8)),
            RenderBehavior::Fail(e) => Err(e.clone()),
            RenderBehavior::Panic => panic!("renderer blew up on {uri}"),
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Publisher that returns `https://objectstore/{id}.png`, or a fixed error.
pub struct MockPublisher {
    error: Option<PublishError>,
    calls: AtomicUsize,
}

impl MockPublisher {
    pub fn new() -> Self {
        Self {
            error: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(error: PublishError) -> Self {
        Self {
            error: Some(error),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn locator_for(job_id: Uuid) -> String {
        format!("https://objectstore/{job_id}.png")
    }
}

#[async_trait]
impl ArtifactPublisher for MockPublisher {
    async fn publish(
        &self,
        job_id: Uuid,
        image: &RasterImage,
    ) -> Result<ArtifactLocator, PublishError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if image.is_empty() {
            return Err(PublishError::EmptyBuffer);
        }
        match &self.error {
            Some(e) => Err(e.clone()),
            None => Ok(ArtifactLocator::new(Self::locator_for(job_id))),
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// In-memory store and queue plus the mocks, wired the way the worker wires them.
pub struct Harness {
    pub store: Arc<InMemoryJobStore>,
    pub queue: Arc<InMemoryQueue>,
    pub renderer: Arc<MockRenderer>,
    pub publisher: Arc<MockPublisher>,
}

impl Harness {
    pub fn new(renderer: MockRenderer, publisher: MockPublisher) -> Self {
        Self {
            store: Arc::new(InMemoryJobStore::new()),
            queue: Arc::new(InMemoryQueue::default()),
            renderer: Arc::new(renderer),
            publisher: Arc::new(publisher),
        }
    }

    /// Store a submitted job and enqueue its message.
    pub async fn submit(&self, uri: &str) -> Job {
        let job = Job::new(uri);
        self.store.insert(&job).await.unwrap();
        self.queue.send(&JobMessage::for_job(&job)).await.unwrap();
        job
    }

    pub async fn job(&self, id: Uuid) -> Job {
        self.store.get(id).await.unwrap().expect("job exists")
    }
}
