mod types;

pub use types::*;

use crate::error::{BackupError, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Flat `name -> value` parameter set, materialized from a config file and
/// the process environment.
pub type Params = BTreeMap<String, String>;

pub const CONFIG_FILE_VAR: &str = "BACKUP_CONFIG_FILE";

const DATABASE_KEYS: [&str; 4] = ["DB_NAME", "DB_HOST", "DB_USER", "DB_PASSWORD"];
const STORAGE_KEYS: [&str; 4] = ["S3_ENDPOINT", "S3_ACCESS_KEY", "S3_SECRET_KEY", "S3_BUCKET"];

const OPTIONAL_KEYS: &[&str] = &[
    "DB_PORT",
    "S3_REGION",
    "S3_PATH_PREFIX",
    "BACKUP_PREFIX",
    "COMPRESSION",
    "ENCRYPTION",
    "AGE_RECIPIENT",
    "AGE_RECIPIENTS_FILE",
    "AGE_BIN",
    "NOTIFY_ENABLED",
    "NOTIFY_WEBHOOK_URL",
    "NOTIFY_CHANNEL",
    "NOTIFY_USERNAME",
    "NOTIFY_ON_SUCCESS",
    "MYSQLDUMP_BIN",
    "MYSQLDUMP_OPTIONS",
    "DUMP_TIMEOUT_SECS",
    "MIN_DUMP_SIZE_BYTES",
    "DUMP_MARKER",
    "UPLOAD_MAX_ATTEMPTS",
    "UPLOAD_RETRY_DELAY_SECS",
    "BACKUP_WORK_DIR",
    "LOCK_DIR",
    "LOG_DIR",
    CONFIG_FILE_VAR,
];

const DEFAULT_DUMP_TIMEOUT_SECS: u64 = 2 * 60 * 60;
const DEFAULT_MIN_DUMP_SIZE_BYTES: u64 = 1024;
const DEFAULT_DUMP_MARKER: &str = "CREATE TABLE";

fn is_known_key(key: &str) -> bool {
    DATABASE_KEYS.contains(&key) || STORAGE_KEYS.contains(&key) || OPTIONAL_KEYS.contains(&key)
}

/// Collects parameters from the optional config file, then overlays the
/// environment on top of it.
pub fn load_params(config_file: Option<&Path>) -> Result<Params> {
    let env_file = std::env::var_os(CONFIG_FILE_VAR).map(PathBuf::from);
    let mut params = match config_file.map(Path::to_path_buf).or(env_file) {
        Some(path) => load_file(&path)?,
        None => Params::new(),
    };

    for (key, value) in std::env::vars() {
        if is_known_key(&key) {
            params.insert(key, value);
        }
    }
    Ok(params)
}

pub fn load_file(path: &Path) -> Result<Params> {
    info!("Loading configuration from {:?}", path);
    let contents = fs::read_to_string(path)
        .map_err(|e| BackupError::Config(format!("cannot read {}: {}", path.display(), e)))?;
    let table: toml::Table = contents.parse()?;

    let mut params = Params::new();
    for (key, value) in table {
        if !is_known_key(&key) {
            debug!("Ignoring unknown config key {}", key);
            continue;
        }
        let value = match value {
            toml::Value::String(s) => s,
            toml::Value::Integer(n) => n.to_string(),
            toml::Value::Float(n) => n.to_string(),
            toml::Value::Boolean(b) => b.to_string(),
            other => {
                return Err(BackupError::Config(format!(
                    "{} must be a scalar, found {}",
                    key,
                    other.type_str()
                )))
            }
        };
        params.insert(key, value);
    }
    Ok(params)
}

fn get<'a>(params: &'a Params, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

fn parse_bool(params: &Params, key: &str, default: bool) -> Result<bool> {
    match get(params, key) {
        None => Ok(default),
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(BackupError::Config(format!(
                "{} must be a boolean, got '{}'",
                key, v
            ))),
        },
    }
}

fn parse_number<T: std::str::FromStr>(params: &Params, key: &str, default: T) -> Result<T> {
    match get(params, key) {
        None => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|_| BackupError::Config(format!("{} must be a number, got '{}'", key, v))),
    }
}

fn require_group(params: &Params, keys: &[&str], group: &str) -> Result<()> {
    let missing: Vec<&str> = keys
        .iter()
        .copied()
        .filter(|k| get(params, k).is_none())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(BackupError::Config(format!(
            "missing required {} settings: {}",
            group,
            missing.join(", ")
        )))
    }
}

fn required(params: &Params, key: &str) -> Result<String> {
    get(params, key)
        .map(str::to_string)
        .ok_or_else(|| BackupError::Config(format!("{} is required", key)))
}

fn normalize_endpoint(raw: &str) -> Result<String> {
    let lower = raw.to_ascii_lowercase();
    if lower.starts_with("https://") {
        Ok(raw.trim_end_matches('/').to_string())
    } else if lower.starts_with("http://") {
        Err(BackupError::Config(format!(
            "S3_ENDPOINT must use https, got '{}'",
            raw
        )))
    } else if raw.contains("://") {
        Err(BackupError::Config(format!(
            "S3_ENDPOINT has an unsupported scheme: '{}'",
            raw
        )))
    } else {
        Ok(format!("https://{}", raw.trim_end_matches('/')))
    }
}

fn parse_compression(params: &Params) -> Result<Compression> {
    match get(params, "COMPRESSION").map(str::to_ascii_lowercase).as_deref() {
        None | Some("none") | Some("off") | Some("false") => Ok(Compression::None),
        Some("gzip") => Ok(Compression::Gzip),
        Some(other) => Err(BackupError::Config(format!(
            "COMPRESSION must be 'gzip' or 'none', got '{}'",
            other
        ))),
    }
}

fn parse_encryption(params: &Params) -> Result<Encryption> {
    match get(params, "ENCRYPTION").map(str::to_ascii_lowercase).as_deref() {
        None | Some("none") | Some("off") | Some("false") => return Ok(Encryption::None),
        Some("age") => {}
        Some(other) => {
            return Err(BackupError::Config(format!(
                "ENCRYPTION must be 'age' or 'none', got '{}'",
                other
            )))
        }
    }

    let recipients = match (get(params, "AGE_RECIPIENT"), get(params, "AGE_RECIPIENTS_FILE")) {
        (Some(_), Some(_)) => {
            return Err(BackupError::Config(
                "AGE_RECIPIENT and AGE_RECIPIENTS_FILE are mutually exclusive".to_string(),
            ))
        }
        (None, None) => {
            return Err(BackupError::Config(
                "ENCRYPTION=age requires AGE_RECIPIENT or AGE_RECIPIENTS_FILE".to_string(),
            ))
        }
        (Some(keys), None) => {
            let keys: Vec<String> = keys
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect();
            if keys.is_empty() {
                return Err(BackupError::Config(
                    "AGE_RECIPIENT does not contain any recipient key".to_string(),
                ));
            }
            Recipients::Keys(keys)
        }
        (None, Some(file)) => Recipients::File(PathBuf::from(file)),
    };

    Ok(Encryption::Age {
        program: get(params, "AGE_BIN").unwrap_or("age").to_string(),
        recipients,
    })
}

fn parse_notifications(params: &Params) -> Result<Option<NotificationConfig>> {
    if !parse_bool(params, "NOTIFY_ENABLED", false)? {
        return Ok(None);
    }
    let webhook_url = get(params, "NOTIFY_WEBHOOK_URL").ok_or_else(|| {
        BackupError::Config("NOTIFY_ENABLED requires NOTIFY_WEBHOOK_URL".to_string())
    })?;

    Ok(Some(NotificationConfig {
        webhook_url: webhook_url.to_string(),
        channel: get(params, "NOTIFY_CHANNEL").map(str::to_string),
        username: get(params, "NOTIFY_USERNAME")
            .unwrap_or("backup-bot")
            .to_string(),
        notify_on_success: parse_bool(params, "NOTIFY_ON_SUCCESS", false)?,
    }))
}

/// Validates the parameter set and builds the immutable job configuration.
/// Pure: touches neither the filesystem nor the network.
pub fn from_params(params: &Params) -> Result<BackupConfig> {
    require_group(params, &DATABASE_KEYS, "database")?;
    require_group(params, &STORAGE_KEYS, "storage")?;

    let database = DatabaseConfig {
        name: required(params, "DB_NAME")?,
        host: required(params, "DB_HOST")?,
        port: parse_number(params, "DB_PORT", 3306)?,
        username: required(params, "DB_USER")?,
        password: required(params, "DB_PASSWORD")?,
    };

    let storage = StorageConfig {
        endpoint: normalize_endpoint(&required(params, "S3_ENDPOINT")?)?,
        region: get(params, "S3_REGION").unwrap_or("us-east-1").to_string(),
        access_key: required(params, "S3_ACCESS_KEY")?,
        secret_key: required(params, "S3_SECRET_KEY")?,
        bucket: required(params, "S3_BUCKET")?,
        path_prefix: get(params, "S3_PATH_PREFIX")
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty()),
    };

    let upload = RetryPolicy {
        max_attempts: parse_number(params, "UPLOAD_MAX_ATTEMPTS", 3)?,
        delay: Duration::from_secs(parse_number(params, "UPLOAD_RETRY_DELAY_SECS", 5)?),
    };
    if upload.max_attempts == 0 {
        return Err(BackupError::Config(
            "UPLOAD_MAX_ATTEMPTS must be at least 1".to_string(),
        ));
    }

    let timeout_secs = parse_number(params, "DUMP_TIMEOUT_SECS", DEFAULT_DUMP_TIMEOUT_SECS)?;
    if timeout_secs == 0 {
        return Err(BackupError::Config(
            "DUMP_TIMEOUT_SECS must be greater than zero".to_string(),
        ));
    }

    Ok(BackupConfig {
        database,
        storage,
        filename_prefix: get(params, "BACKUP_PREFIX").unwrap_or("backup").to_string(),
        compression: parse_compression(params)?,
        encryption: parse_encryption(params)?,
        notifications: parse_notifications(params)?,
        dump: DumpConfig {
            program: get(params, "MYSQLDUMP_BIN").unwrap_or("mysqldump").to_string(),
            options: get(params, "MYSQLDUMP_OPTIONS").map(str::to_string),
            timeout: Duration::from_secs(timeout_secs),
        },
        integrity: IntegrityConfig {
            min_size_bytes: parse_number(params, "MIN_DUMP_SIZE_BYTES", DEFAULT_MIN_DUMP_SIZE_BYTES)?,
            marker: get(params, "DUMP_MARKER")
                .unwrap_or(DEFAULT_DUMP_MARKER)
                .to_string(),
        },
        upload,
        work_dir: get(params, "BACKUP_WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir),
        lock_dir: get(params, "LOCK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir),
        log_dir: get(params, "LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("logs")),
    })
}

#[cfg(test)]
pub(crate) fn base_params() -> Params {
    [
        ("DB_NAME", "shop"),
        ("DB_HOST", "db.internal"),
        ("DB_USER", "backup"),
        ("DB_PASSWORD", "hunter2"),
        ("S3_ENDPOINT", "s3.example.com"),
        ("S3_ACCESS_KEY", "AKIA123"),
        ("S3_SECRET_KEY", "topsecret"),
        ("S3_BUCKET", "backups"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}
