//! Generic webhook notification channel.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::NotificationChannel;
use crate::notification::events::{NotificationEvent, NotificationPriority};
use crate::{Error, Result};

/// Webhook channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub url: String,
    /// Optional bearer token.
    pub token: Option<String>,
    /// Minimum priority level to send.
    pub min_priority: NotificationPriority,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            token: None,
            min_priority: NotificationPriority::Low,
            timeout_secs: 30,
        }
    }
}

/// Posts each notification as JSON to a URL.
pub struct WebhookChannel {
    config: WebhookConfig,
    client: Client,
}

impl WebhookChannel {
    pub fn new(config: WebhookConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();

        Self { config, client }
    }

    fn build_payload(&self, event: &NotificationEvent) -> serde_json::Value {
        json!({
            "event_type": event.kind.as_str(),
            "priority": event.priority().to_string(),
            "title": event.title(),
            "description": event.description(),
            "timestamp": event.timestamp.to_rfc3339(),
            "job_id": event.job.id,
            "data": event
        })
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn channel_type(&self) -> &'static str {
        "webhook"
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled && !self.config.url.is_empty()
    }

    async fn send(&self, event: &NotificationEvent) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        if event.priority() < self.config.min_priority {
            debug!(
                "Skipping webhook notification for {} (priority {} < {})",
                event.kind,
                event.priority(),
                self.config.min_priority
            );
            return Ok(());
        }

        let mut request = self
            .client
            .post(&self.config.url)
            .json(&self.build_payload(event));
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Other(format!("Webhook request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Other(format!("Webhook failed: {status} - {body}")));
        }

        debug!("Webhook notification sent: {}", event.kind);
        Ok(())
    }
}
