//! Notification event types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::JobSnapshot;

/// What happened to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Newly admitted to a recording slot.
    Queued,
    /// Newly rejected for lack of a slot.
    TooMany,
    /// Admitted show longer than the configured warning threshold.
    LongShow,
    /// Capture ended before the show did.
    Partial,
    CaptureStarted,
    CaptureReady,
    /// Abandoned after an unexpected error.
    JobFailed,
    /// Disappeared from the schedule before capture began.
    ShowVanished,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::TooMany => "too_many",
            Self::LongShow => "long_show",
            Self::Partial => "partial",
            Self::CaptureStarted => "capture_started",
            Self::CaptureReady => "capture_ready",
            Self::JobFailed => "job_failed",
            Self::ShowVanished => "show_vanished",
        }
    }

    pub fn priority(&self) -> NotificationPriority {
        match self {
            Self::Queued | Self::CaptureStarted | Self::CaptureReady => NotificationPriority::Low,
            Self::LongShow => NotificationPriority::Normal,
            Self::TooMany | Self::Partial => NotificationPriority::High,
            Self::JobFailed | Self::ShowVanished => NotificationPriority::Critical,
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification priority levels.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum NotificationPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl fmt::Display for NotificationPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// A notification about one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub kind: NotificationKind,
    pub job: JobSnapshot,
    /// Free-form detail, e.g. the reason a capture was partial.
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn new(kind: NotificationKind, job: JobSnapshot) -> Self {
        Self {
            kind,
            job,
            message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn priority(&self) -> NotificationPriority {
        self.kind.priority()
    }

    pub fn title(&self) -> String {
        let what = match self.kind {
            NotificationKind::Queued => "Queued",
            NotificationKind::TooMany => "Too many captures",
            NotificationKind::LongShow => "Long show queued",
            NotificationKind::Partial => "Partial capture",
            NotificationKind::CaptureStarted => "Capture started",
            NotificationKind::CaptureReady => "Capture ready",
            NotificationKind::JobFailed => "Capture failed",
            NotificationKind::ShowVanished => "Show removed from schedule",
        };
        format!("{what}: {}", self.job.description)
    }

    pub fn description(&self) -> String {
        let mut text = format!(
            "{} ({} - {}, {} minutes)",
            self.job.description,
            self.job.start.format("%a %H:%M"),
            self.job.end.format("%H:%M"),
            self.job.duration_minutes
        );
        if let Some(message) = &self.message {
            text.push_str(": ");
            text.push_str(message);
        }
        text
    }
}
