use async_trait::async_trait;
use tracing::{info, warn};

use super::NotificationChannel;
use crate::Result;
use crate::notification::events::{NotificationEvent, NotificationPriority};

/// Writes notifications to the application log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    fn channel_type(&self) -> &'static str {
        "log"
    }

    fn is_enabled(&self) -> bool {
        true
    }

    async fn send(&self, event: &NotificationEvent) -> Result<()> {
        if event.priority() >= NotificationPriority::High {
            warn!(kind = %event.kind, "{}", event.description());
        } else {
            info!(kind = %event.kind, "{}", event.description());
        }
        Ok(())
    }
}
