use super::{NotificationEvent, Notifier, Status};
use crate::config::NotificationConfig;
use crate::error::{BackupError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Posts Slack/Mattermost-style incoming-webhook messages.
pub struct WebhookNotifier {
    config: NotificationConfig,
    client: Client,
}

#[derive(Debug, Serialize)]
struct WebhookPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<String>,
    username: String,
    text: String,
    attachments: Vec<Attachment>,
}

#[derive(Debug, Serialize)]
struct Attachment {
    color: &'static str,
    fields: Vec<Field>,
}

#[derive(Debug, Serialize)]
struct Field {
    title: &'static str,
    value: String,
    short: bool,
}

fn field(title: &'static str, value: impl Into<String>, short: bool) -> Field {
    Field {
        title,
        value: value.into(),
        short,
    }
}

impl WebhookNotifier {
    pub fn new(config: &NotificationConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("sql-s3-backup/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            config: config.clone(),
            client,
        })
    }

    fn payload(&self, event: &NotificationEvent) -> WebhookPayload {
        let (icon, color) = match event.status {
            Status::Success => ("✅", "good"),
            Status::Failure => ("❌", "danger"),
        };

        let mut fields = vec![
            field("Database", format!("`{}`", event.database), true),
            field("Duration", format!("{} seconds", event.duration_secs), true),
            field(
                "Timestamp",
                event.timestamp.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
                true,
            ),
        ];
        if let Some(kind) = &event.error_kind {
            fields.push(field("Error", kind.clone(), true));
        }
        if let Some(stage) = &event.stage {
            fields.push(field("Stage", stage.clone(), true));
        }
        if let Some(artifact) = &event.artifact {
            fields.push(field("File", format!("`{}`", artifact), false));
        }
        if let Some(size) = event.size_bytes {
            fields.push(field(
                "Size",
                format!("{:.2} MB", size as f64 / 1024.0 / 1024.0),
                true,
            ));
        }
        if let Some(hash) = &event.sha256 {
            fields.push(field("SHA256", format!("`{}`", hash), false));
        }
        if let Some(location) = &event.location {
            fields.push(field("Location", location.clone(), false));
        }
        if let Some(log_file) = &event.log_file {
            fields.push(field("Logs", log_file.clone(), false));
        }

        WebhookPayload {
            channel: self.config.channel.clone(),
            username: self.config.username.clone(),
            text: format!("{} {}", icon, event.message),
            attachments: vec![Attachment { color, fields }],
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, event: &NotificationEvent) -> Result<()> {
        let response = self
            .client
            .post(&self.config.webhook_url)
            .json(&self.payload(event))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(BackupError::Notification(format!(
                "webhook returned {} - {}",
                status, text
            )));
        }

        debug!("Webhook notification delivered");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notifier(channel: Option<&str>) -> WebhookNotifier {
        WebhookNotifier::new(&NotificationConfig {
            webhook_url: "https://hooks.example.com/services/T0/B0".to_string(),
            channel: channel.map(str::to_string),
            username: "backup-bot".to_string(),
            notify_on_success: true,
        })
        .unwrap()
    }

    #[test]
    fn test_failure_payload() {
        let mut event = NotificationEvent::new(
            Status::Failure,
            "shop",
            "Backup of shop failed".to_string(),
            42,
        );
        event.error_kind = Some("IntegrityError".to_string());
        event.stage = Some("verify".to_string());
        event.log_file = Some("/var/log/backup/backup_shop.log".to_string());

        let value = serde_json::to_value(notifier(Some("#ops")).payload(&event)).unwrap();

        assert_eq!(value["channel"], "#ops");
        assert_eq!(value["username"], "backup-bot");
        assert_eq!(value["text"], "❌ Backup of shop failed");
        assert_eq!(value["attachments"][0]["color"], "danger");
        let fields = value["attachments"][0]["fields"].as_array().unwrap();
        let titles: Vec<&str> = fields.iter().map(|f| f["title"].as_str().unwrap()).collect();
        assert_eq!(titles, vec!["Database", "Duration", "Timestamp", "Error", "Stage", "Logs"]);
    }

    #[test]
    fn test_success_payload_omits_channel_when_unset() {
        let mut event = NotificationEvent::new(
            Status::Success,
            "shop",
            "Backup of shop completed".to_string(),
            7,
        );
        event.size_bytes = Some(2 * 1024 * 1024);
        event.location = Some("backups/a.sql.gz".to_string());

        let value = serde_json::to_value(notifier(None).payload(&event)).unwrap();

        assert!(value.get("channel").is_none());
        assert_eq!(value["attachments"][0]["color"], "good");
        let fields = value["attachments"][0]["fields"].as_array().unwrap();
        assert!(fields.iter().any(|f| f["value"] == "2.00 MB"));
    }

    #[test]
    fn test_event_serializes_status_lowercase() {
        let event = NotificationEvent::new(Status::Success, "shop", String::new(), 1);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["status"], "success");
        assert!(value.get("error_kind").is_none());
    }
}
