//! Renderer and artifact publisher implementations.

mod artifact_store;
pub mod cdp;
pub mod chromium;
pub mod filesystem;
pub mod s3;

use std::sync::Arc;

use pagesnap_core::{ArtifactPublisher, Error, Result};

pub use chromium::{ChromiumConfig, ChromiumRenderer};
pub use filesystem::FilesystemPublisher;
pub use s3::{Credentials, S3Config, S3Publisher};

/// Where artifacts are published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactBackend {
    S3,
    Filesystem,
}

impl std::str::FromStr for ArtifactBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "s3" => Ok(Self::S3),
            "filesystem" | "fs" => Ok(Self::Filesystem),
            other => Err(Error::Config(format!(
                "unknown ARTIFACT_BACKEND `{other}` (expected `s3` or `filesystem`)"
            ))),
        }
    }
}

/// Build the publisher selected by `ARTIFACT_BACKEND` (default `s3`).
pub fn publisher_from_env() -> Result<Arc<dyn ArtifactPublisher>> {
    let backend: ArtifactBackend = std::env::var("ARTIFACT_BACKEND")
        .unwrap_or_else(|_| "s3".to_string())
        .parse()?;
    Ok(match backend {
        ArtifactBackend::S3 => Arc::new(S3Publisher::new(S3Config::from_env()?)?),
        ArtifactBackend::Filesystem => Arc::new(FilesystemPublisher::from_env()?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_backend_parse() {
        assert_eq!("s3".parse::<ArtifactBackend>().unwrap(), ArtifactBackend::S3);
        assert_eq!(
            " Filesystem ".parse::<ArtifactBackend>().unwrap(),
            ArtifactBackend::Filesystem
        );
        assert!(matches!(
            "gcs".parse::<ArtifactBackend>(),
            Err(Error::Config(_))
        ));
    }
}
