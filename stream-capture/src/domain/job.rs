//! Recording jobs.
//!
//! A `RecordingJob` is created when a show first matches a keyword rule and
//! lives in the master job set until its window has passed. Its lifecycle is
//! an explicit `JobPhase` state machine; `manual`, `starred` and `email` are
//! advisory flags that never take part in transitions.
//!
//! Jobs are shared as `Arc<RecordingJob>` between the scheduling loop, the
//! job's own orchestrator task and the control surface.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{Duration, NaiveDateTime};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::channel::{ChannelOption, Preferences};
use super::show::parse_feed_time;
use crate::{Error, Result};

/// Stable job identity: raw start time followed by the description.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey(String);

impl JobKey {
    pub fn new(raw_start: &str, description: &str) -> Self {
        Self(format!("{raw_start}{description}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The time window of a show.
///
/// Raw times come from the feed; computed times apply padding and the
/// configured feed offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobWindow {
    pub raw_start: String,
    pub raw_end: String,
    pub runtime_minutes: i64,
    pub pre_minutes: i64,
    pub post_minutes: i64,
    pub offset_hours: i32,
    start: NaiveDateTime,
    end: NaiveDateTime,
}

impl JobWindow {
    pub fn new(
        raw_start: &str,
        raw_end: &str,
        runtime_minutes: i64,
        pre_minutes: i64,
        post_minutes: i64,
        offset_hours: i32,
    ) -> Result<Self> {
        let parse = |raw: &str| {
            parse_feed_time(raw)
                .ok_or_else(|| Error::Other(format!("Unrecognised schedule time {raw:?}")))
        };
        let offset = Duration::hours(offset_hours as i64);
        let start = parse(raw_start)? - Duration::minutes(pre_minutes) + offset;
        let end = parse(raw_end)? + Duration::minutes(post_minutes) + offset;

        Ok(Self {
            raw_start: raw_start.to_string(),
            raw_end: raw_end.to_string(),
            runtime_minutes,
            pre_minutes,
            post_minutes,
            offset_hours,
            start,
            end,
        })
    }

    /// Padded, offset start.
    pub fn start(&self) -> NaiveDateTime {
        self.start
    }

    /// Padded, offset end.
    pub fn end(&self) -> NaiveDateTime {
        self.end
    }

    /// Runtime including padding, in minutes.
    pub fn duration_minutes(&self) -> i64 {
        self.runtime_minutes + self.pre_minutes + self.post_minutes
    }
}

/// Lifecycle of a recording job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    /// Matched a keyword rule, not yet evaluated by admission.
    Selected,
    /// Admitted, orchestrator not yet spawned.
    Queued,
    /// Rejected by admission for lack of a slot.
    TooMany,
    /// Orchestrator spawned, sleeping until the start time.
    Waiting,
    Authenticating,
    SourceSelection,
    Capturing,
    RetryDecision,
    Finalizing,
    /// Captured the full window.
    Completed,
    /// Captured less than the full window.
    Partial,
    Cancelled,
    /// Abandoned after a job-fatal error.
    Failed,
}

impl JobPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Selected => "selected",
            Self::Queued => "queued",
            Self::TooMany => "too_many",
            Self::Waiting => "waiting",
            Self::Authenticating => "authenticating",
            Self::SourceSelection => "source_selection",
            Self::Capturing => "capturing",
            Self::RetryDecision => "retry_decision",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn can_transition_to(&self, next: JobPhase) -> bool {
        use JobPhase::*;
        matches!(
            (self, next),
            (Selected, Queued | TooMany | Cancelled)
                | (Queued, TooMany | Waiting | Cancelled)
                | (TooMany, Queued | Cancelled)
                | (Waiting, Authenticating | TooMany | Cancelled | Failed)
                | (Authenticating, SourceSelection | Failed)
                | (SourceSelection, Capturing | Failed)
                | (Capturing, RetryDecision | Finalizing | Failed)
                | (RetryDecision, Capturing | Finalizing | Failed)
                | (Finalizing, Completed | Partial | Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Partial | Self::Cancelled | Self::Failed
        )
    }

    /// Phases whose slot admission must not take away.
    pub fn is_pinned(&self) -> bool {
        matches!(
            self,
            Self::Authenticating
                | Self::SourceSelection
                | Self::Capturing
                | Self::RetryDecision
                | Self::Finalizing
        )
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued | Self::Waiting | Self::Completed | Self::Partial) || self.is_pinned()
    }

    pub fn is_process_spawned(&self) -> bool {
        matches!(self, Self::Waiting | Self::Completed | Self::Partial) || self.is_pinned()
    }

    pub fn is_too_many(&self) -> bool {
        *self == Self::TooMany
    }

    /// Finished capturing, fully or partially.
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed | Self::Partial)
    }

    pub fn is_partial(&self) -> bool {
        *self == Self::Partial
    }

    pub fn is_capture_started(&self) -> bool {
        matches!(
            self,
            Self::Capturing
                | Self::RetryDecision
                | Self::Finalizing
                | Self::Completed
                | Self::Partial
        )
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Schedule- and rule-derived job fields, overwritten on every refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDetails {
    /// Feed id of the show.
    pub id: String,
    pub description: String,
    pub category: String,
    pub window: JobWindow,
    pub preferences: Preferences,
    /// Position of the matching keyword rule; lower is more important.
    pub rank: usize,
    pub channels: Vec<ChannelOption>,
    /// Base name for capture segments and the job log.
    pub file_name: String,
}

/// One targeted show capture.
#[derive(Debug)]
pub struct RecordingJob {
    key: JobKey,
    discovery_seq: u64,
    details: RwLock<JobDetails>,
    phase: Mutex<JobPhase>,
    manual: AtomicBool,
    starred: AtomicBool,
    email: AtomicBool,
    cancel: CancellationToken,
    wake: Notify,
    spawn_epoch: AtomicU64,
}

impl RecordingJob {
    pub fn new(details: JobDetails, discovery_seq: u64, starred: bool, email: bool) -> Self {
        Self {
            key: JobKey::new(&details.window.raw_start, &details.description),
            discovery_seq,
            details: RwLock::new(details),
            phase: Mutex::new(JobPhase::Selected),
            manual: AtomicBool::new(false),
            starred: AtomicBool::new(starred),
            email: AtomicBool::new(email),
            cancel: CancellationToken::new(),
            wake: Notify::new(),
            spawn_epoch: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> &JobKey {
        &self.key
    }

    /// Order in which the job was first discovered; breaks priority ties.
    pub fn discovery_seq(&self) -> u64 {
        self.discovery_seq
    }

    pub fn details(&self) -> JobDetails {
        self.details.read().clone()
    }

    pub fn id(&self) -> String {
        self.details.read().id.clone()
    }

    pub fn description(&self) -> String {
        self.details.read().description.clone()
    }

    pub fn rank(&self) -> usize {
        self.details.read().rank
    }

    pub fn start(&self) -> NaiveDateTime {
        self.details.read().window.start()
    }

    pub fn end(&self) -> NaiveDateTime {
        self.details.read().window.end()
    }

    pub fn channels(&self) -> Vec<ChannelOption> {
        self.details.read().channels.clone()
    }

    /// Overwrite schedule- and rule-derived fields, keeping the phase and the
    /// manual flag.
    pub fn refresh(&self, details: JobDetails, starred: bool, email: bool) {
        *self.details.write() = details;
        self.starred.store(starred, Ordering::Relaxed);
        self.email.store(email, Ordering::Relaxed);
    }

    pub fn set_channels(&self, channels: Vec<ChannelOption>) {
        self.details.write().channels = channels;
    }

    pub fn phase(&self) -> JobPhase {
        *self.phase.lock()
    }

    /// Move to `next`, failing if the state machine does not allow it.
    pub fn transition_to(&self, next: JobPhase) -> Result<()> {
        let mut phase = self.phase.lock();
        if *phase == next {
            return Ok(());
        }
        if !phase.can_transition_to(next) {
            return Err(Error::InvalidStateTransition {
                from: phase.to_string(),
                to: next.to_string(),
            });
        }
        *phase = next;
        Ok(())
    }

    /// Move to `next` only if the job is currently in `expected`.
    pub fn transition_if(&self, expected: JobPhase, next: JobPhase) -> bool {
        let mut phase = self.phase.lock();
        if *phase != expected || !phase.can_transition_to(next) {
            return false;
        }
        *phase = next;
        true
    }

    /// Move a queued job to `Waiting`, returning the epoch that identifies
    /// the orchestrator being spawned for it.
    pub fn mark_spawned(&self) -> Result<u64> {
        let mut phase = self.phase.lock();
        if !phase.can_transition_to(JobPhase::Waiting) {
            return Err(Error::InvalidStateTransition {
                from: phase.to_string(),
                to: JobPhase::Waiting.to_string(),
            });
        }
        *phase = JobPhase::Waiting;
        Ok(self.spawn_epoch.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Leave `Waiting` for `Authenticating` if the orchestrator spawned at
    /// `epoch` still owns the job.
    pub fn begin_capture(&self, epoch: u64) -> bool {
        let mut phase = self.phase.lock();
        if *phase != JobPhase::Waiting || self.spawn_epoch.load(Ordering::SeqCst) != epoch {
            return false;
        }
        *phase = JobPhase::Authenticating;
        true
    }

    /// Whether the orchestrator spawned at `epoch` still owns the job.
    pub fn owns_spawn(&self, epoch: u64) -> bool {
        self.spawn_epoch.load(Ordering::SeqCst) == epoch
    }

    pub fn is_manual(&self) -> bool {
        self.manual.load(Ordering::Relaxed)
    }

    pub fn mark_manual(&self) {
        self.manual.store(true, Ordering::Relaxed);
    }

    pub fn is_starred(&self) -> bool {
        self.starred.load(Ordering::Relaxed)
    }

    pub fn wants_email(&self) -> bool {
        self.email.load(Ordering::Relaxed)
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Raise the cancellation handle and wake a waiting orchestrator.
    ///
    /// Jobs that never spawned an orchestrator move straight to `Cancelled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
        {
            let mut phase = self.phase.lock();
            if matches!(
                *phase,
                JobPhase::Selected | JobPhase::Queued | JobPhase::TooMany
            ) {
                *phase = JobPhase::Cancelled;
            }
        }
        self.wake.notify_one();
    }

    /// Wake the orchestrator if it is sleeping in `Waiting`.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub(crate) fn wake_signal(&self) -> &Notify {
        &self.wake
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let details = self.details.read();
        let phase = self.phase();
        JobSnapshot {
            key: self.key.clone(),
            id: details.id.clone(),
            description: details.description.clone(),
            category: details.category.clone(),
            start: details.window.start(),
            end: details.window.end(),
            duration_minutes: details.window.duration_minutes(),
            rank: details.rank,
            phase,
            queued: phase.is_queued(),
            too_many: phase.is_too_many(),
            process_spawned: phase.is_process_spawned(),
            capture_started: phase.is_capture_started(),
            completed: phase.is_completed(),
            partial: phase.is_partial(),
            cancelled: self.is_cancelled(),
            manual: self.is_manual(),
            starred: self.is_starred(),
            email: self.wants_email(),
        }
    }
}

/// Point-in-time, serialisable view of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub key: JobKey,
    pub id: String,
    pub description: String,
    pub category: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub duration_minutes: i64,
    pub rank: usize,
    pub phase: JobPhase,
    pub queued: bool,
    pub too_many: bool,
    pub process_spawned: bool,
    pub capture_started: bool,
    pub completed: bool,
    pub partial: bool,
    pub cancelled: bool,
    pub manual: bool,
    pub starred: bool,
    pub email: bool,
}
