use std::fmt;
use std::io;
use std::time::Duration;

#[derive(Debug)]
pub enum BackupError {
    Config(String),
    AlreadyRunning { database: String, pid: u32 },
    Lock(String),
    Connectivity(String),
    Dump(String),
    DumpTimeout(Duration),
    Integrity(String),
    Compression(String),
    Encryption(String),
    Upload { attempts: u32, last_error: String },
    UploadUnconfirmed(String),
    Notification(String),
    Interrupted,
    Io(io::Error),
}

impl BackupError {
    /// Label of the pipeline stage the error originates from, used as the
    /// `stage` field in log lines.
    pub fn stage(&self) -> &'static str {
        match self {
            BackupError::Config(_) => "validate",
            BackupError::AlreadyRunning { .. } | BackupError::Lock(_) => "lock",
            BackupError::Connectivity(_) => "connect",
            BackupError::Dump(_) | BackupError::DumpTimeout(_) => "dump",
            BackupError::Integrity(_) => "verify",
            BackupError::Compression(_) => "compress",
            BackupError::Encryption(_) => "encrypt",
            BackupError::Upload { .. } => "upload",
            BackupError::UploadUnconfirmed(_) => "confirm",
            BackupError::Notification(_) => "notify",
            BackupError::Interrupted => "signal",
            BackupError::Io(_) => "io",
        }
    }

    /// Classification reported to operators in failure notifications.
    pub fn kind(&self) -> &'static str {
        match self {
            BackupError::Config(_) => "ConfigError",
            BackupError::AlreadyRunning { .. } => "ConcurrencyError",
            BackupError::Lock(_) => "LockError",
            BackupError::Connectivity(_) => "ConnectivityError",
            BackupError::Dump(_) => "DumpError",
            BackupError::DumpTimeout(_) => "DumpTimeoutError",
            BackupError::Integrity(_) => "IntegrityError",
            BackupError::Compression(_) | BackupError::Encryption(_) => "TransformError",
            BackupError::Upload { .. } => "UploadError",
            BackupError::UploadUnconfirmed(_) => "UploadUnconfirmedError",
            BackupError::Notification(_) => "NotificationError",
            BackupError::Interrupted => "Interrupted",
            BackupError::Io(_) => "IoError",
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            BackupError::Io(_) | BackupError::Lock(_) | BackupError::Notification(_) => 1,
            BackupError::Config(_) => 2,
            BackupError::AlreadyRunning { .. } => 3,
            BackupError::Connectivity(_) => 4,
            BackupError::Dump(_) => 5,
            BackupError::DumpTimeout(_) => 6,
            BackupError::Integrity(_) => 7,
            BackupError::Compression(_) | BackupError::Encryption(_) => 8,
            BackupError::Upload { .. } => 9,
            BackupError::UploadUnconfirmed(_) => 10,
            BackupError::Interrupted => 130,
        }
    }
}

impl fmt::Display for BackupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupError::Config(msg) => write!(f, "Configuration error: {}", msg),
            BackupError::AlreadyRunning { database, pid } => write!(
                f,
                "A backup of '{}' is already running (pid {})",
                database, pid
            ),
            BackupError::Lock(msg) => write!(f, "Lock error: {}", msg),
            BackupError::Connectivity(msg) => write!(f, "Database unreachable: {}", msg),
            BackupError::Dump(msg) => write!(f, "Dump error: {}", msg),
            BackupError::DumpTimeout(limit) => {
                write!(f, "Dump exceeded the {} second timeout", limit.as_secs())
            }
            BackupError::Integrity(msg) => write!(f, "Integrity check failed: {}", msg),
            BackupError::Compression(msg) => write!(f, "Compression error: {}", msg),
            BackupError::Encryption(msg) => write!(f, "Encryption error: {}", msg),
            BackupError::Upload {
                attempts,
                last_error,
            } => write!(
                f,
                "Upload failed after {} attempt(s): {}",
                attempts, last_error
            ),
            BackupError::UploadUnconfirmed(msg) => {
                write!(f, "Upload could not be confirmed: {}", msg)
            }
            BackupError::Notification(msg) => write!(f, "Notification error: {}", msg),
            BackupError::Interrupted => write!(f, "Interrupted by signal"),
            BackupError::Io(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for BackupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BackupError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for BackupError {
    fn from(err: io::Error) -> Self {
        BackupError::Io(err)
    }
}

impl From<toml::de::Error> for BackupError {
    fn from(err: toml::de::Error) -> Self {
        BackupError::Config(format!("invalid config file: {}", err))
    }
}

impl From<mysql_async::Error> for BackupError {
    fn from(err: mysql_async::Error) -> Self {
        BackupError::Connectivity(err.to_string())
    }
}

impl From<reqwest::Error> for BackupError {
    fn from(err: reqwest::Error) -> Self {
        BackupError::Notification(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
