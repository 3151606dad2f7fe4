//! Upload path shared by the `object_store` backed publishers.
//!
//! Both the S3 and the filesystem publisher hand a PNG to an
//! [`ObjectStore`] under the key `{job_id}.png`. Concurrent puts of the same
//! key are safe: each one stages its own object and the last to land wins.

use std::time::Instant;

use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use tracing::{debug, info, warn};
use uuid::Uuid;

use pagesnap_core::{artifact_key, ArtifactLocator, PublishError, RasterImage};

/// Store `image` as `{job_id}.png` and return its locator under `public_base_url`.
pub(crate) async fn put_artifact(
    store: &dyn ObjectStore,
    component: &'static str,
    public_base_url: &str,
    job_id: Uuid,
    image: &RasterImage,
) -> Result<ArtifactLocator, PublishError> {
    if image.is_empty() {
        return Err(PublishError::EmptyBuffer);
    }

    let start = Instant::now();
    let key = artifact_key(job_id);
    debug!(
        subsystem = "jobs",
        component,
        op = "publish",
        job_id = %job_id,
        key = %key,
        image_bytes = image.len(),
        "Uploading artifact"
    );

    let payload = PutPayload::from(image.data.clone());
    if let Err(e) = store.put(&ObjectPath::from(key.as_str()), payload).await {
        let err = classify(e);
        warn!(
            subsystem = "jobs",
            component,
            op = "publish",
            job_id = %job_id,
            error = %err,
            duration_ms = start.elapsed().as_millis() as u64,
            "Artifact upload failed"
        );
        return Err(err);
    }

    info!(
        subsystem = "jobs",
        component,
        op = "publish",
        job_id = %job_id,
        image_bytes = image.len(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Artifact uploaded"
    );
    Ok(locator(public_base_url, &key))
}

pub(crate) fn locator(public_base_url: &str, key: &str) -> ArtifactLocator {
    ArtifactLocator::new(format!("{}/{}", public_base_url.trim_end_matches('/'), key))
}

/// Map a store failure onto the publish taxonomy. Anything that is not a
/// refusal of the request itself counts as the store being unavailable.
pub(crate) fn classify(err: object_store::Error) -> PublishError {
    let message = err.to_string();
    match err {
        object_store::Error::PermissionDenied { .. }
        | object_store::Error::Unauthenticated { .. } => PublishError::PermissionDenied(message),
        object_store::Error::NotFound { .. }
        | object_store::Error::InvalidPath { .. }
        | object_store::Error::AlreadyExists { .. }
        | object_store::Error::Precondition { .. }
        | object_store::Error::NotImplemented => PublishError::Rejected(message),
        _ => PublishError::Unavailable(message),
    }
}
