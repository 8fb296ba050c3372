use super::store::{ObjectStore, RemoteLocation};
use crate::config::StorageConfig;
use crate::error::{BackupError, Result};
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::{BehaviorVersion, Credentials, Region};
use s3::error::DisplayErrorContext;
use s3::primitives::ByteStream;
use std::path::Path;
use tracing::debug;

/// S3-compatible object storage. Credentials stay in memory; nothing is
/// written to disk for the client.
pub struct S3Store {
    client: s3::Client,
}

impl S3Store {
    pub async fn new(config: &StorageConfig) -> Self {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .endpoint_url(&config.endpoint)
            .region(Region::new(config.region.clone()))
            .credentials_provider(Credentials::new(
                &config.access_key,
                &config.secret_key,
                None,
                None,
                "Static",
            ))
            .load()
            .await;

        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build();

        Self {
            client: s3::Client::from_conf(s3_config),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(&self, local: &Path, location: &RemoteLocation) -> Result<()> {
        let body = ByteStream::from_path(local)
            .await
            .map_err(|e| BackupError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        self.client
            .put_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                BackupError::Upload {
                    attempts: 1,
                    last_error: DisplayErrorContext(&e).to_string(),
                }
            })?;

        debug!("PutObject accepted for {}", location);
        Ok(())
    }

    async fn stat(&self, location: &RemoteLocation) -> Result<Option<u64>> {
        match self
            .client
            .head_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .send()
            .await
        {
            Ok(head) => Ok(Some(
                head.content_length().and_then(|l| u64::try_from(l).ok()).unwrap_or(0),
            )),
            Err(e) if e.as_service_error().map(|s| s.is_not_found()).unwrap_or(false) => Ok(None),
            Err(e) => Err(BackupError::UploadUnconfirmed(
                DisplayErrorContext(&e).to_string(),
            )),
        }
    }

    fn name(&self) -> &'static str {
        "S3"
    }
}
