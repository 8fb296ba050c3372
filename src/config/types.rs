use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone)]
pub struct DatabaseConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Clone)]
pub struct StorageConfig {
    pub endpoint: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub path_prefix: Option<String>,
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("bucket", &self.bucket)
            .field("path_prefix", &self.path_prefix)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
}

/// Who an encrypted artifact is readable by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipients {
    Keys(Vec<String>),
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encryption {
    None,
    Age {
        program: String,
        recipients: Recipients,
    },
}

#[derive(Clone)]
pub struct NotificationConfig {
    pub webhook_url: String,
    pub channel: Option<String>,
    pub username: String,
    pub notify_on_success: bool,
}

impl fmt::Debug for NotificationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Webhook paths carry the token; keep only scheme and host.
        let host_end = self
            .webhook_url
            .match_indices('/')
            .nth(2)
            .map_or(self.webhook_url.len(), |(i, _)| i);
        f.debug_struct("NotificationConfig")
            .field("webhook_url", &format!("{}/<redacted>", &self.webhook_url[..host_end]))
            .field("channel", &self.channel)
            .field("username", &self.username)
            .field("notify_on_success", &self.notify_on_success)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct DumpConfig {
    pub program: String,
    /// Raw option string that replaces the default snapshot options.
    pub options: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct IntegrityConfig {
    pub min_size_bytes: u64,
    pub marker: String,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub filename_prefix: String,
    pub compression: Compression,
    pub encryption: Encryption,
    pub notifications: Option<NotificationConfig>,
    pub dump: DumpConfig,
    pub integrity: IntegrityConfig,
    pub upload: RetryPolicy,
    pub work_dir: PathBuf,
    pub lock_dir: PathBuf,
    pub log_dir: PathBuf,
}
