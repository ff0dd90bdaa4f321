//! Fan-out of notification events to the configured channels.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::channels::{LogChannel, NotificationChannel, WebhookChannel, WebhookConfig};
use super::events::{NotificationEvent, NotificationKind};
use crate::domain::RecordingJob;

/// Configuration for the notification service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationServiceConfig {
    /// Whether the notification service is enabled.
    pub enabled: bool,
    /// Mirror every notification into the application log.
    pub log: bool,
    pub webhook: Option<WebhookConfig>,
}

impl Default for NotificationServiceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log: true,
            webhook: None,
        }
    }
}

/// Dispatches notifications without blocking the caller.
#[derive(Clone)]
pub struct NotificationService {
    enabled: bool,
    channels: Vec<Arc<dyn NotificationChannel>>,
}

impl NotificationService {
    pub fn new(config: &NotificationServiceConfig) -> Self {
        let mut channels: Vec<Arc<dyn NotificationChannel>> = Vec::new();
        if config.log {
            channels.push(Arc::new(LogChannel));
        }
        if let Some(webhook) = &config.webhook {
            channels.push(Arc::new(WebhookChannel::new(webhook.clone())));
        }
        Self {
            enabled: config.enabled,
            channels,
        }
    }

    /// A service delivering to the given channels only.
    pub fn with_channels(channels: Vec<Arc<dyn NotificationChannel>>) -> Self {
        Self {
            enabled: true,
            channels,
        }
    }

    /// A service that drops everything.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            channels: Vec::new(),
        }
    }

    /// Notify about `job`.
    pub fn notify_job(&self, kind: NotificationKind, job: &RecordingJob, message: Option<String>) {
        let mut event = NotificationEvent::new(kind, job.snapshot());
        event.message = message;
        self.notify(event);
    }

    /// Queue delivery of `event` on every enabled channel. Failures are
    /// logged and dropped.
    pub fn notify(&self, event: NotificationEvent) {
        if !self.enabled {
            return;
        }
        debug!(kind = %event.kind, job = %event.job.description, "Dispatching notification");

        let event = Arc::new(event);
        for channel in self.channels.iter().filter(|c| c.is_enabled()) {
            let channel = Arc::clone(channel);
            let event = Arc::clone(&event);
            tokio::spawn(async move {
                if let Err(e) = channel.send(&event).await {
                    warn!(
                        channel = channel.channel_type(),
                        kind = %event.kind,
                        "Failed to deliver notification: {}",
                        e
                    );
                }
            });
        }
    }
}
