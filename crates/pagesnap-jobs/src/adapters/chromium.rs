//! Headless Chromium renderer.
//!
//! Every render launches its own browser with a throwaway profile, so no
//! cookies, cache or storage leak between jobs. The child is spawned with
//! `kill_on_drop` and the profile is a [`TempDir`]: dropping a render future
//! (for example on timeout) kills the browser and removes the profile.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tracing::{debug, info, trace, warn};

use pagesnap_core::defaults::{
    BROWSER_CLOSE_GRACE_MS, CHROME_BINARY, VIEWPORT_HEIGHT, VIEWPORT_WIDTH,
};
use pagesnap_core::{RasterImage, RenderError, Renderer};

use super::cdp::CdpConnection;

/// How long the browser gets to print its DevTools endpoint.
const LAUNCH_TIMEOUT_SECS: u64 = 30;

/// Prefix Chromium prints on stderr once DevTools is ready.
const DEVTOOLS_BANNER: &str = "DevTools listening on ";

/// Lines of stderr kept for launch failure messages.
const STDERR_TAIL_LINES: usize = 5;

/// Flags that make Chromium work inside containers without kernel sandboxing.
const CHROME_FLAGS: &[&str] = &[
    "--headless=new",
    "--no-sandbox",
    "--disable-setuid-sandbox",
    "--disable-dev-shm-usage",
    "--disable-gpu",
    "--hide-scrollbars",
    "--mute-audio",
    "--no-first-run",
    "--no-default-browser-check",
    "--remote-debugging-port=0",
];

/// Chromium renderer configuration.
#[derive(Debug, Clone)]
pub struct ChromiumConfig {
    /// Browser executable, absolute or looked up on `PATH`.
    pub binary: PathBuf,
    pub viewport_width: u32,
    pub viewport_height: u32,
    /// Extra command-line flags appended after the defaults.
    pub extra_args: Vec<String>,
    pub launch_timeout: Duration,
}

impl Default for ChromiumConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from(CHROME_BINARY),
            viewport_width: VIEWPORT_WIDTH,
            viewport_height: VIEWPORT_HEIGHT,
            extra_args: Vec::new(),
            launch_timeout: Duration::from_secs(LAUNCH_TIMEOUT_SECS),
        }
    }
}

impl ChromiumConfig {
    /// `CHROME_PATH`, `RENDER_VIEWPORT_WIDTH`, `RENDER_VIEWPORT_HEIGHT`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            binary: std::env::var("CHROME_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.binary),
            viewport_width: std::env::var("RENDER_VIEWPORT_WIDTH")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.viewport_width),
            viewport_height: std::env::var("RENDER_VIEWPORT_HEIGHT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.viewport_height),
            ..defaults
        }
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_viewport(mut self, width: u32, height: u32) -> Self {
        self.viewport_width = width;
        self.viewport_height = height;
        self
    }
}

/// Renders pages with a fresh headless Chromium per call.
pub struct ChromiumRenderer {
    config: ChromiumConfig,
}

impl ChromiumRenderer {
    pub fn new(config: ChromiumConfig) -> Self {
        info!(
            subsystem = "jobs",
            component = "chromium",
            binary = %config.binary.display(),
            viewport_width = config.viewport_width,
            viewport_height = config.viewport_height,
            "Initializing Chromium renderer"
        );
        Self { config }
    }

    pub fn config(&self) -> &ChromiumConfig {
        &self.config
    }
}

#[async_trait]
impl Renderer for ChromiumRenderer {
    async fn render(&self, uri: &str) -> Result<RasterImage, RenderError> {
        if uri.trim().is_empty() {
            return Err(RenderError::EmptyUri);
        }
        let start = Instant::now();

        let profile = TempDir::new()
            .map_err(|e| RenderError::Launch(format!("cannot create profile directory: {e}")))?;

        let mut child = Command::new(&self.config.binary)
            .args(CHROME_FLAGS)
            .args(&self.config.extra_args)
            .arg(format!("--user-data-dir={}", profile.path().display()))
            .arg("about:blank")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RenderError::Launch(format!(
                    "cannot start {}: {e}",
                    self.config.binary.display()
                ))
            })?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RenderError::Launch("browser stderr not captured".into()))?;
        let ws_url = tokio::time::timeout(self.config.launch_timeout, devtools_endpoint(stderr))
            .await
            .map_err(|_| {
                RenderError::Launch(format!(
                    "browser did not announce DevTools within {}s",
                    self.config.launch_timeout.as_secs()
                ))
            })??;
        debug!(subsystem = "jobs", component = "chromium", %ws_url, "Browser launched");

        let mut conn = CdpConnection::connect(&ws_url).await?;
        let result = capture_page(
            &mut conn,
            uri,
            self.config.viewport_width,
            self.config.viewport_height,
        )
        .await;

        // Polite shutdown, then make sure the process is gone.
        let _ = conn.call("Browser.close", json!({}), None).await;
        conn.close().await;
        let grace = Duration::from_millis(BROWSER_CLOSE_GRACE_MS);
        if tokio::time::timeout(grace, child.wait()).await.is_err() {
            warn!(subsystem = "jobs", component = "chromium", "Browser ignored close, killing");
            let _ = child.kill().await;
        }
        drop(profile);

        if let Ok(image) = &result {
            debug!(
                subsystem = "jobs",
                component = "chromium",
                op = "render",
                width = image.width,
                height = image.height,
                image_bytes = image.len(),
                duration_ms = start.elapsed().as_millis() as u64,
                "Page captured"
            );
        }
        result
    }

    fn name(&self) -> &str {
        "chromium"
    }
}

/// Read stderr until Chromium prints its DevTools WebSocket URL.
///
/// Keeps draining the pipe in the background afterwards so the browser
/// never blocks on a full stderr buffer.
async fn devtools_endpoint(stderr: ChildStderr) -> Result<String, RenderError> {
    let mut lines = BufReader::new(stderr).lines();
    let mut tail: Vec<String> = Vec::new();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| RenderError::Launch(format!("cannot read browser output: {e}")))?
    {
        if let Some(url) = line.trim().strip_prefix(DEVTOOLS_BANNER) {
            let url = url.trim().to_string();
            tokio::spawn(async move {
                while let Ok(Some(line)) = lines.next_line().await {
                    trace!(subsystem = "jobs", component = "chromium", "{line}");
                }
            });
            return Ok(url);
        }
        if tail.len() == STDERR_TAIL_LINES {
            tail.remove(0);
        }
        tail.push(line);
    }

    Err(RenderError::Launch(format!(
        "browser exited before DevTools was ready: {}",
        tail.join(" | ")
    )))
}

/// Drive one page through navigation and full-page capture.
pub(crate) async fn capture_page(
    conn: &mut CdpConnection,
    uri: &str,
    viewport_width: u32,
    viewport_height: u32,
) -> Result<RasterImage, RenderError> {
    let target = conn
        .call("Target.createTarget", json!({ "url": "about:blank" }), None)
        .await?;
    let target_id = str_field(&target, "targetId")?;

    let attached = conn
        .call(
            "Target.attachToTarget",
            json!({ "targetId": target_id, "flatten": true }),
            None,
        )
        .await?;
    let session_id = str_field(&attached, "sessionId")?;
    let session = Some(session_id.as_str());

    conn.call("Page.enable", json!({}), session).await?;
    conn.call(
        "Emulation.setDeviceMetricsOverride",
        json!({
            "width": viewport_width,
            "height": viewport_height,
            "deviceScaleFactor": 1,
            "mobile": false,
        }),
        session,
    )
    .await?;

    let navigation = conn
        .call("Page.navigate", json!({ "url": uri }), session)
        .await?;
    if let Some(error_text) = navigation
        .get("errorText")
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
    {
        return Err(navigation_error(error_text));
    }

    conn.wait_for_event("Page.loadEventFired", session).await?;

    let metrics = conn
        .call("Page.getLayoutMetrics", json!({}), session)
        .await?;
    let (content_width, content_height) = content_size(&metrics)?;
    let clip_width = content_width.max(viewport_width as f64).ceil();
    let clip_height = content_height.max(1.0).ceil();

    let shot = conn
        .call(
            "Page.captureScreenshot",
            json!({
                "format": "png",
                "captureBeyondViewport": true,
                "fromSurface": true,
                "clip": {
                    "x": 0,
                    "y": 0,
                    "width": clip_width,
                    "height": clip_height,
                    "scale": 1,
                },
            }),
            session,
        )
        .await?;
    let encoded = str_field(&shot, "data")?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.as_bytes())
        .map_err(|e| RenderError::InvalidImage(format!("screenshot is not base64: {e}")))?;

    RasterImage::from_png(bytes)
}

fn navigation_error(error_text: &str) -> RenderError {
    if error_text.starts_with("net::") {
        RenderError::Network(error_text.to_string())
    } else {
        RenderError::Navigation(error_text.to_string())
    }
}

fn content_size(metrics: &Value) -> Result<(f64, f64), RenderError> {
    let size = metrics
        .get("cssContentSize")
        .or_else(|| metrics.get("contentSize"))
        .ok_or_else(|| RenderError::Protocol("layout metrics without content size".into()))?;
    let width = size.get("width").and_then(Value::as_f64);
    let height = size.get("height").and_then(Value::as_f64);
    match (width, height) {
        (Some(w), Some(h)) => Ok((w, h)),
        _ => Err(RenderError::Protocol("content size missing width/height".into())),
    }
}

fn str_field(value: &Value, field: &str) -> Result<String, RenderError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| RenderError::Protocol(format!("response missing `{field}`")))
}
