//! Filesystem artifact publisher for single-host deployments.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use object_store::local::LocalFileSystem;
use tracing::info;
use uuid::Uuid;

use pagesnap_core::defaults::ARTIFACT_DIR;
use pagesnap_core::{ArtifactLocator, ArtifactPublisher, Error, PublishError, RasterImage, Result};

use super::artifact_store::put_artifact;

/// Writes `{dir}/{job_id}.png` and returns `{public_base_url}/{job_id}.png`.
///
/// Each write is staged in its own file next to the target and renamed into
/// place, so readers never see a partial PNG.
pub struct FilesystemPublisher {
    store: LocalFileSystem,
    base_path: PathBuf,
    public_base_url: String,
}

impl FilesystemPublisher {
    /// Create the directory if needed. Locators are `file://` URLs into it.
    pub fn new(base_path: impl AsRef<Path>) -> Result<Self> {
        let requested = base_path.as_ref();
        std::fs::create_dir_all(requested).map_err(|e| {
            Error::Config(format!(
                "cannot create artifact directory {}: {e}",
                requested.display()
            ))
        })?;
        let base_path = requested.canonicalize().map_err(|e| {
            Error::Config(format!(
                "cannot resolve artifact directory {}: {e}",
                requested.display()
            ))
        })?;
        let store = LocalFileSystem::new_with_prefix(&base_path)
            .map_err(|e| Error::Config(format!("artifact directory: {e}")))?;

        info!(
            subsystem = "jobs",
            component = "filesystem",
            path = %base_path.display(),
            "Initializing filesystem artifact publisher"
        );
        Ok(Self {
            store,
            public_base_url: format!("file://{}", base_path.display()),
            base_path,
        })
    }

    /// Serve locators from `url` instead (e.g. a static file server in front of the directory).
    pub fn with_public_base_url(mut self, url: impl Into<String>) -> Self {
        self.public_base_url = url.into();
        self
    }

    /// `ARTIFACT_DIR` (default `/var/lib/pagesnap/artifacts`) and
    /// `ARTIFACT_PUBLIC_BASE_URL` (default `file://{dir}`).
    pub fn from_env() -> Result<Self> {
        let dir = std::env::var("ARTIFACT_DIR").unwrap_or_else(|_| ARTIFACT_DIR.to_string());
        let publisher = Self::new(dir)?;
        Ok(match std::env::var("ARTIFACT_PUBLIC_BASE_URL") {
            Ok(url) if !url.is_empty() => publisher.with_public_base_url(url),
            _ => publisher,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

#[async_trait]
impl ArtifactPublisher for FilesystemPublisher {
    async fn publish(
        &self,
        job_id: Uuid,
        image: &RasterImage,
    ) -> std::result::Result<ArtifactLocator, PublishError> {
        put_artifact(&self.store, "filesystem", &self.public_base_url, job_id, image).await
    }

    fn name(&self) -> &str {
        "filesystem"
    }
}
