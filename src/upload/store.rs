use crate::error::Result;
use async_trait::async_trait;
use std::fmt;
use std::path::Path;

/// Where an artifact lands: `bucket` plus `[prefix/]file_name` as the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLocation {
    pub bucket: String,
    pub key: String,
}

impl RemoteLocation {
    pub fn new(bucket: &str, prefix: Option<&str>, file_name: &str) -> Self {
        let key = match prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
            Some(prefix) => format!("{}/{}", prefix, file_name),
            None => file_name.to_string(),
        };
        Self {
            bucket: bucket.to_string(),
            key,
        }
    }
}

impl fmt::Display for RemoteLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, local: &Path, location: &RemoteLocation) -> Result<()>;
    /// Size of the remote object, or `None` when it does not exist.
    async fn stat(&self, location: &RemoteLocation) -> Result<Option<u64>>;
    fn name(&self) -> &'static str;
}
