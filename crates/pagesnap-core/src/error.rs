//! Error types for pagesnap.

use std::time::Duration;

use thiserror::Error;

/// Result type alias using pagesnap's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for store, queue and gateway operations.
///
/// Any of these returned from a job store call during a status transition is
/// a store write failure: the lifecycle controller leaves the message
/// unacknowledged and lets redelivery retry the job.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Job not found
    #[error("Job not found: {0}")]
    JobNotFound(uuid::Uuid),

    /// Message queue operation failed
    #[error("Queue error: {0}")]
    Queue(String),

    /// Job store is unavailable (non-database backends)
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Failure to turn a URI into a raster image.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// No URI to render.
    #[error("Render error: empty URI")]
    EmptyUri,

    /// The browser process could not be started or never announced DevTools.
    #[error("Render error: browser launch failed: {0}")]
    Launch(String),

    /// The render did not finish within its time budget.
    #[error("Render timeout: page did not finish rendering within {}s", .0.as_secs())]
    Timeout(Duration),

    /// DNS, connection or TLS failure reaching the URI.
    #[error("Render error: network failure: {0}")]
    Network(String),

    /// Navigation was refused or aborted for a non-network reason.
    #[error("Render error: navigation failed: {0}")]
    Navigation(String),

    /// The browser or page crashed, or the process exited unexpectedly.
    #[error("Render error: browser crashed: {0}")]
    Crashed(String),

    /// The browser answered with something the adapter did not expect.
    #[error("Render error: protocol error: {0}")]
    Protocol(String),

    /// The captured buffer is not a PNG image.
    #[error("Render error: invalid image: {0}")]
    InvalidImage(String),
}

/// Failure to store a rendered artifact.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// Nothing to upload.
    #[error("Publish error: empty buffer")]
    EmptyBuffer,

    /// The object store could not be reached or answered with a server error.
    #[error("Publish error: object store unavailable: {0}")]
    Unavailable(String),

    /// The object store refused the credentials or the write.
    #[error("Publish error: permission denied: {0}")]
    PermissionDenied(String),

    /// The object store rejected the request for another reason, such as a
    /// missing bucket or an invalid key.
    #[error("Publish error: rejected: {0}")]
    Rejected(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_error_display_not_found() {
        let err = Error::NotFound("test resource".to_string());
        assert_eq!(err.to_string(), "Not found: test resource");
    }

    #[test]
    fn test_error_display_job_not_found() {
        let id = Uuid::nil();
        let err = Error::JobNotFound(id);
        assert_eq!(err.to_string(), format!("Job not found: {}", id));
    }

    #[test]
    fn test_error_display_queue() {
        let err = Error::Queue("connection reset".to_string());
        assert_eq!(err.to_string(), "Queue error: connection reset");
    }

    #[test]
    fn test_error_display_invalid_input() {
        let err = Error::InvalidInput("uri is required".to_string());
        assert_eq!(err.to_string(), "Invalid input: uri is required");
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
        assert!(err.to_string().starts_with("Serialization error:"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_render_timeout_mentions_timeout() {
        let err = RenderError::Timeout(Duration::from_secs(60));
        let msg = err.to_string();
        assert!(msg.to_lowercase().contains("timeout"));
        assert!(msg.contains("60s"));
    }

    #[test]
    fn test_render_error_network_display() {
        let err = RenderError::Network("net::ERR_NAME_NOT_RESOLVED".to_string());
        assert_eq!(
            err.to_string(),
            "Render error: network failure: net::ERR_NAME_NOT_RESOLVED"
        );
    }

    #[test]
    fn test_publish_error_rejected_display() {
        let err = PublishError::Rejected("bucket `shots` not found".to_string());
        assert_eq!(
            err.to_string(),
            "Publish error: rejected: bucket `shots` not found"
        );
    }

    #[test]
    fn test_errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Error>();
        assert_send_sync::<RenderError>();
        assert_send_sync::<PublishError>();
    }
}
