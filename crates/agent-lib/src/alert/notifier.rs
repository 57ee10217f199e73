//! Notification channels

use crate::models::{Severity, TargetRef};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;
use url::Url;

/// Default timeout for webhook requests
const DEFAULT_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// One message to deliver on every configured channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub target: TargetRef,
    pub category: String,
    pub severity: Option<Severity>,
    pub summary: String,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    /// Single-line rendering used by chat webhooks
    pub fn text(&self) -> String {
        match self.severity {
            Some(severity) => format!(
                "[{}] {} on {}: {}",
                severity, self.category, self.target.name, self.summary
            ),
            None => format!("{} on {}: {}", self.category, self.target.name, self.summary),
        }
    }
}

/// A notification channel
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    /// Channel name reported in alert outcomes
    fn channel(&self) -> &str;

    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Writes notifications to the structured log
#[derive(Debug, Clone)]
pub struct LogNotifier {
    name: String,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self {
            name: "log".to_string(),
        }
    }
}

impl Default for LogNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    fn channel(&self) -> &str {
        &self.name
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        info!(
            event = "notification",
            target_id = %notification.target.id,
            target_name = %notification.target.name,
            category = %notification.category,
            severity = ?notification.severity,
            summary = %notification.summary,
            "{}",
            notification.text()
        );
        Ok(())
    }
}

/// Webhook body; `text` makes it usable with Slack-style incoming hooks
#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    text: String,
    target_id: &'a str,
    target_name: &'a str,
    category: &'a str,
    severity: Option<Severity>,
    summary: &'a str,
    timestamp: DateTime<Utc>,
}

/// Posts notifications as JSON to an HTTP endpoint
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    name: String,
    client: Client,
    url: Url,
    timeout: Duration,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Result<Self> {
        let url = Url::parse(url).context("Invalid webhook URL")?;
        let client = Client::builder()
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            name: "webhook".to_string(),
            client,
            url,
            timeout: DEFAULT_WEBHOOK_TIMEOUT,
        })
    }

    /// Name this channel in alert outcomes
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn channel(&self) -> &str {
        &self.name
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        let payload = WebhookPayload {
            text: notification.text(),
            target_id: &notification.target.id,
            target_name: &notification.target.name,
            category: &notification.category,
            severity: notification.severity,
            summary: &notification.summary,
            timestamp: notification.timestamp,
        };

        self.client
            .post(self.url.clone())
            .json(&payload)
            .timeout(self.timeout)
            .send()
            .await
            .context("Webhook request failed")?
            .error_for_status()
            .context("Webhook rejected notification")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn notification() -> Notification {
        Notification {
            target: TargetRef::new("c-1", "api-2"),
            category: "health:high_cpu".to_string(),
            severity: Some(Severity::High),
            summary: "cpu 97%".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_notification_text() {
        assert_eq!(
            notification().text(),
            "[high] health:high_cpu on api-2: cpu 97%"
        );
    }

    #[tokio::test]
    async fn test_webhook_posts_json() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hooks/ops")
            .match_body(mockito::Matcher::PartialJson(json!({
                "target_id": "c-1",
                "category": "health:high_cpu",
                "severity": "high",
                "text": "[high] health:high_cpu on api-2: cpu 97%"
            })))
            .with_status(200)
            .create_async()
            .await;

        let webhook = WebhookNotifier::new(&format!("{}/hooks/ops", server.url())).unwrap();
        webhook.send(&notification()).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_webhook_error_status_fails() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/hooks/ops")
            .with_status(503)
            .create_async()
            .await;

        let webhook = WebhookNotifier::new(&format!("{}/hooks/ops", server.url()))
            .unwrap()
            .with_name("ops-webhook");
        assert_eq!(webhook.channel(), "ops-webhook");
        assert!(webhook.send(&notification()).await.is_err());
    }

    #[test]
    fn test_webhook_rejects_bad_url() {
        assert!(WebhookNotifier::new("not a url").is_err());
    }
}
