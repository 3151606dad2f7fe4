//! Centralized default constants for pagesnap.
//!
//! Every crate and binary reads its fallback values from here so that the
//! documented defaults and the running defaults cannot drift apart.

// =============================================================================
// RENDERING
// =============================================================================

/// Viewport width in device-independent pixels. Wide enough that responsive
/// pages lay out in their desktop form.
pub const VIEWPORT_WIDTH: u32 = 2560;

/// Viewport height in device-independent pixels.
pub const VIEWPORT_HEIGHT: u32 = 1600;

/// Upper bound on a single render (launch, navigation and capture).
pub const RENDER_TIMEOUT_SECS: u64 = 60;

/// Chromium executable looked up on `PATH` when `CHROME_PATH` is unset.
pub const CHROME_BINARY: &str = "chromium";

/// Grace period for the browser to exit after `Browser.close` before it is killed.
pub const BROWSER_CLOSE_GRACE_MS: u64 = 2_000;

// =============================================================================
// ARTIFACTS
// =============================================================================

/// Content type of every published artifact.
pub const ARTIFACT_CONTENT_TYPE: &str = "image/png";

/// File extension appended to the job id to form the storage key.
pub const ARTIFACT_EXTENSION: &str = "png";

/// Default S3 endpoint (path-style addressing).
pub const S3_ENDPOINT: &str = "https://s3.amazonaws.com";

/// Default S3 region used for request signing.
pub const S3_REGION: &str = "us-east-1";

/// Canned ACL applied to uploaded artifacts so the locator is publicly readable.
pub const S3_ACL: &str = "public-read";

/// Default directory for the filesystem publisher.
pub const ARTIFACT_DIR: &str = "/var/lib/pagesnap/artifacts";

// =============================================================================
// WORKER
// =============================================================================

/// Maximum number of jobs a single worker process holds in `started` at once.
pub const WORKER_MAX_CONCURRENT: usize = 3;

/// How long a single queue receive waits for messages (long polling).
pub const QUEUE_WAIT_SECS: u64 = 20;

/// Back-off between receives after an empty or failed poll.
pub const QUEUE_POLL_INTERVAL_MS: u64 = 500;

/// Deliveries of a message whose job record cannot be found before the
/// message is dropped.
pub const WORKER_MAX_ORPHAN_RECEIVES: u32 = 5;

/// Capacity of the worker event broadcast channel.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// QUEUE
// =============================================================================

/// Name of the logical queue inside the shared queue table.
pub const QUEUE_NAME: &str = "screenshots";

/// How long a received message stays invisible before it is redelivered.
/// Must exceed the render timeout plus publish time.
pub const QUEUE_VISIBILITY_TIMEOUT_SECS: u64 = 300;

// =============================================================================
// GATEWAY
// =============================================================================

/// Enqueue attempts after the job record has been written.
pub const ENQUEUE_MAX_ATTEMPTS: u32 = 3;

/// Base delay for the enqueue retry back-off.
pub const ENQUEUE_RETRY_BASE_MS: u64 = 100;

/// Default listen port for the HTTP API.
pub const API_PORT: u16 = 3000;

// =============================================================================
// DATABASE
// =============================================================================

/// Default PostgreSQL connection string.
pub const DATABASE_URL: &str = "postgres://localhost/pagesnap";

/// Connections per pool. The worker uses one per in-flight job plus one for
/// receiving, so keep this above `WORKER_MAX_CONCURRENT`.
pub const DATABASE_MAX_CONNECTIONS: u32 = 10;

/// How long a caller waits for a free pooled connection.
pub const DATABASE_ACQUIRE_TIMEOUT_SECS: u64 = 30;
