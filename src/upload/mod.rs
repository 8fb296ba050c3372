mod s3;
mod store;

pub use s3::S3Store;
pub use store::{ObjectStore, RemoteLocation};

use crate::backup::artifact::Artifact;
use crate::config::RetryPolicy;
use crate::error::{BackupError, Result};
use tracing::{info, warn};

/// Retry bookkeeping for one upload.
#[derive(Debug, Default)]
pub struct UploadAttempt {
    pub attempt: u32,
    pub last_error: Option<String>,
}

/// Puts the artifact with a fixed delay between attempts. An attempt only
/// counts once the store has accepted it; the caller still has to `confirm`.
pub async fn upload_with_retry(
    store: &dyn ObjectStore,
    artifact: &Artifact,
    location: &RemoteLocation,
    policy: &RetryPolicy,
) -> Result<u32> {
    let mut state = UploadAttempt::default();

    while state.attempt < policy.max_attempts {
        state.attempt += 1;
        info!(
            attempt = state.attempt,
            max_attempts = policy.max_attempts,
            "Uploading {} to {} ({})",
            artifact.file_name(),
            location,
            store.name()
        );

        match store.put(artifact.path(), location).await {
            Ok(()) => {
                if state.attempt > 1 {
                    info!("Upload succeeded after {} attempts", state.attempt);
                }
                return Ok(state.attempt);
            }
            Err(e) => {
                let message = match e {
                    BackupError::Upload { last_error, .. } => last_error,
                    other => other.to_string(),
                };
                if state.attempt < policy.max_attempts {
                    warn!(
                        attempt = state.attempt,
                        "Upload attempt failed: {}; retrying in {}s",
                        message,
                        policy.delay.as_secs()
                    );
                    tokio::time::sleep(policy.delay).await;
                }
                state.last_error = Some(message);
            }
        }
    }

    Err(BackupError::Upload {
        attempts: state.attempt,
        last_error: state.last_error.unwrap_or_default(),
    })
}

/// Independently checks the object is present with the expected size.
pub async fn confirm(
    store: &dyn ObjectStore,
    artifact: &Artifact,
    location: &RemoteLocation,
) -> Result<u64> {
    let remote_size = match store.stat(location).await {
        Ok(Some(size)) => size,
        Ok(None) => {
            return Err(BackupError::UploadUnconfirmed(format!(
                "{} not found after upload",
                location
            )))
        }
        Err(e @ BackupError::UploadUnconfirmed(_)) => return Err(e),
        Err(e) => return Err(BackupError::UploadUnconfirmed(e.to_string())),
    };

    if remote_size != artifact.size() {
        return Err(BackupError::UploadUnconfirmed(format!(
            "{} is {} bytes remotely, expected {}",
            location,
            remote_size,
            artifact.size()
        )));
    }

    info!("Confirmed {} ({} bytes)", location, remote_size);
    Ok(remote_size)
}
