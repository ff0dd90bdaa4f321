//! Notifications about job admission and capture outcomes.
//!
//! Delivery is fire-and-forget: the recorder never waits on, or fails
//! because of, a notification channel.

pub mod channels;
mod events;
mod service;

pub use channels::{LogChannel, NotificationChannel, WebhookChannel, WebhookConfig};
pub use events::{NotificationEvent, NotificationKind, NotificationPriority};
pub use service::{NotificationService, NotificationServiceConfig};
