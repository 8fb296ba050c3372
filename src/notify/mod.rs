mod webhook;

pub use webhook::WebhookNotifier;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Failure,
}

/// Outcome record sent to the notification channel once per job.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationEvent {
    pub status: Status,
    pub database: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub duration_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
}

impl NotificationEvent {
    pub fn new(status: Status, database: &str, message: String, duration_secs: u64) -> Self {
        Self {
            status,
            database: database.to_string(),
            message,
            timestamp: Utc::now(),
            duration_secs,
            error_kind: None,
            stage: None,
            artifact: None,
            size_bytes: None,
            sha256: None,
            location: None,
            log_file: None,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, event: &NotificationEvent) -> Result<()>;
    fn name(&self) -> &'static str;
}
