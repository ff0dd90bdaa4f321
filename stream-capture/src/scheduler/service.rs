//! The scheduling control loop.
//!
//! One task owns the job registry. It re-reads the schedule at the configured
//! hours, recomputes admission and spawns an orchestrator for every newly
//! admitted job. Operator commands arrive over a channel and are applied
//! between refreshes, so the registry keeps a single writer.

use std::sync::Arc;

use chrono::{Duration, NaiveDateTime, NaiveTime};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::{JobPhase, JobSnapshot, RecordingJob, ShowEntry};
use crate::downloader::SourceRanker;
use crate::keywords::KeywordMatcher;
use crate::notification::NotificationKind;
use crate::recorder::{RecorderContext, RecordingOrchestrator};
use crate::retention;
use crate::scheduler::admission::{AdmissionOutcome, AdmissionParams, AdmissionScheduler};
use crate::scheduler::registry::JobRegistry;
use crate::{Error, Result};

const COMMAND_BUFFER: usize = 32;

/// Earliest configured check hour strictly after `now`, rolling over to the
/// next day.
pub fn next_check_time(now: NaiveDateTime, hours: &[u32]) -> NaiveDateTime {
    let at = |date: chrono::NaiveDate, hour: u32| {
        date.and_time(NaiveTime::from_hms_opt(hour, 0, 0).unwrap_or(NaiveTime::MIN))
    };
    let today = now.date();
    let mut sorted: Vec<u32> = hours.iter().copied().filter(|h| *h < 24).collect();
    sorted.sort_unstable();

    if let Some(hour) = sorted.iter().find(|h| at(today, **h) > now) {
        return at(today, *hour);
    }
    match sorted.first() {
        Some(hour) => at(today + Duration::days(1), *hour),
        None => now + Duration::hours(1),
    }
}

/// Requests accepted by the scheduling loop.
#[derive(Debug)]
pub enum ControlCommand {
    Cancel {
        id: String,
        reply: oneshot::Sender<usize>,
    },
    QueueManual {
        id: String,
        reply: oneshot::Sender<Result<JobSnapshot>>,
    },
    Wake,
    Snapshot {
        reply: oneshot::Sender<Vec<JobSnapshot>>,
    },
}

/// Cloneable handle for operating on a running [`ScheduleService`].
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<ControlCommand>,
}

impl ControlHandle {
    async fn send(&self, command: ControlCommand) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| Error::Other("schedule service is not running".to_string()))
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ControlCommand,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply)).await?;
        rx.await
            .map_err(|_| Error::Other("schedule service dropped the request".to_string()))
    }

    /// Cancel every job with feed id `id`. Returns how many were cancelled.
    pub async fn cancel(&self, id: impl Into<String>) -> Result<usize> {
        let id = id.into();
        self.request(|reply| ControlCommand::Cancel { id, reply }).await
    }

    /// Queue the show with feed id `id` regardless of capacity.
    pub async fn queue_manual(&self, id: impl Into<String>) -> Result<JobSnapshot> {
        let id = id.into();
        self.request(|reply| ControlCommand::QueueManual { id, reply })
            .await?
    }

    /// Recompute admission now.
    pub async fn wake(&self) -> Result<()> {
        self.send(ControlCommand::Wake).await
    }

    /// Current view of every job in the registry.
    pub async fn snapshot(&self) -> Result<Vec<JobSnapshot>> {
        self.request(|reply| ControlCommand::Snapshot { reply }).await
    }
}

/// Owns the job registry and spawns orchestrators.
pub struct ScheduleService {
    ctx: RecorderContext,
    matcher: Arc<dyn KeywordMatcher>,
    registry: JobRegistry,
    shows: Vec<ShowEntry>,
    commands: mpsc::Receiver<ControlCommand>,
    recordings: JoinSet<JobPhase>,
    retention: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl ScheduleService {
    pub fn new(
        ctx: RecorderContext,
        matcher: Arc<dyn KeywordMatcher>,
        shutdown: CancellationToken,
    ) -> (Self, ControlHandle) {
        let (tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let service = Self {
            ctx,
            matcher,
            registry: JobRegistry::new(),
            shows: Vec::new(),
            commands,
            recordings: JoinSet::new(),
            retention: None,
            shutdown,
        };
        (service, ControlHandle { tx })
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Number of orchestrators still running.
    pub fn active_recordings(&self) -> usize {
        self.recordings.len()
    }

    fn admission_params(&self) -> AdmissionParams {
        let config = &self.ctx.config;
        let now = self.ctx.clock.now();
        AdmissionParams {
            now,
            future_cutoff: config.future_cutoff(now),
            concurrency_cap: config.concurrent_captures,
            starred_bonus: config.additional_starred_captures,
            long_show_minutes: config.long_show_hours * 60,
        }
    }

    /// Re-read the schedule and update the registry. A failed fetch keeps the
    /// previous feed.
    pub async fn refresh_schedule(&mut self) -> Result<()> {
        let shows = self.ctx.schedule.fetch_shows().await?;
        let now = self.ctx.clock.now();
        let created = self.registry.apply_schedule(
            &shows,
            self.matcher.as_ref(),
            self.ctx.config.schedule_time_offset_hours,
            now,
        );
        self.shows = shows;
        let removed = self.registry.cleanup(now);
        info!(
            shows = self.shows.len(),
            created,
            removed,
            jobs = self.registry.len(),
            "Schedule refreshed"
        );
        Ok(())
    }

    /// Recompute admission, send notifications and spawn orchestrators for
    /// newly admitted jobs.
    pub fn admit(&mut self) -> AdmissionOutcome {
        let params = self.admission_params();
        let outcome = AdmissionScheduler::compute_queue(&self.registry.jobs(), &params);
        self.notify(&outcome);

        for job in &outcome.admitted {
            if job.phase() == JobPhase::Queued {
                self.start_recording(job);
            }
        }
        outcome
    }

    fn notify(&self, outcome: &AdmissionOutcome) {
        let notifier = &self.ctx.notifier;
        for job in &outcome.newly_queued {
            notifier.notify_job(NotificationKind::Queued, job, None);
        }
        for job in &outcome.newly_too_many {
            notifier.notify_job(NotificationKind::TooMany, job, None);
        }
        for job in &outcome.long_shows {
            let hours = (job.end() - job.start()).num_minutes() as f64 / 60.0;
            notifier.notify_job(
                NotificationKind::LongShow,
                job,
                Some(format!("{hours:.1} hours")),
            );
        }
    }

    fn start_recording(&mut self, job: &Arc<RecordingJob>) {
        match RecordingOrchestrator::new(self.ctx.clone(), Arc::clone(job)) {
            Ok(orchestrator) => {
                debug!(show = %job.description(), "Spawning recording task");
                self.recordings.spawn(orchestrator.run());
            }
            Err(e) => warn!(show = %job.description(), "Could not start recording: {}", e),
        }
    }

    fn start_retention(&mut self) {
        if self.retention.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!("Previous cleanup still running");
            return;
        }
        let config = Arc::clone(&self.ctx.config);
        let now = self.ctx.clock.now();
        self.retention = Some(tokio::spawn(async move {
            let removed = retention::clean_old_files(&config, now).await;
            info!(removed, "Old file cleanup finished");
        }));
    }

    /// One full cycle: refresh, admit, clean up old files.
    pub async fn run_cycle(&mut self) -> AdmissionOutcome {
        if let Err(e) = self.refresh_schedule().await {
            error!("Could not read the schedule: {}", e);
        }
        let outcome = self.admit();
        self.start_retention();
        outcome
    }

    /// Build the queue once and log what would be recorded, without
    /// starting any capture.
    pub async fn dry_run(&mut self) -> Result<Vec<JobSnapshot>> {
        self.refresh_schedule().await?;
        let params = self.admission_params();
        let outcome = AdmissionScheduler::compute_queue(&self.registry.jobs(), &params);
        let servers = self.ctx.config.servers();

        for job in &outcome.admitted {
            let details = job.details();
            info!(
                show = %details.description,
                start = %details.window.start(),
                end = %details.window.end(),
                rank = details.rank,
                "Would record"
            );
            let ranker = SourceRanker::new(
                &details.channels,
                &details.preferences,
                &servers,
                &self.ctx.history,
            );
            for pair in ranker.pairs() {
                info!(
                    pair = %pair,
                    quality = %pair.channel.quality,
                    language = %pair.channel.language,
                    score = pair.channel.score,
                    kbps = pair.kbps,
                    "  candidate"
                );
            }
        }
        for job in &outcome.newly_too_many {
            info!(show = %job.description(), start = %job.start(), "Would skip, too many at once");
        }
        Ok(outcome.admitted.iter().map(|job| job.snapshot()).collect())
    }

    /// Apply one operator command. Returns whether admission should be
    /// recomputed.
    pub async fn handle_command(&mut self, command: ControlCommand) -> bool {
        match command {
            ControlCommand::Cancel { id, reply } => {
                let cancelled = self.registry.cancel(&id);
                if cancelled == 0 {
                    warn!(id = %id, "No job to cancel");
                }
                let _ = reply.send(cancelled);
                cancelled > 0
            }
            ControlCommand::QueueManual { id, reply } => {
                let result = self.queue_manual(&id).await;
                let recompute = result.is_ok();
                let _ = reply.send(result);
                recompute
            }
            ControlCommand::Wake => true,
            ControlCommand::Snapshot { reply } => {
                let snapshot = self.registry.jobs().iter().map(|job| job.snapshot()).collect();
                let _ = reply.send(snapshot);
                false
            }
        }
    }

    async fn queue_manual(&mut self, id: &str) -> Result<JobSnapshot> {
        let offset = self.ctx.config.schedule_time_offset_hours;
        let known = self.shows.iter().any(|show| show.id == id)
            || !self.registry.find_by_id(id).is_empty();
        if !known && let Err(e) = self.refresh_schedule().await {
            warn!("Could not refresh the schedule for a manual queue: {}", e);
        }
        let job = self
            .registry
            .queue_manual(id, &self.shows, self.matcher.as_ref(), offset)?;
        Ok(job.snapshot())
    }

    /// Run until the shutdown token fires, then cancel every job and wait
    /// for the orchestrators to finish.
    pub async fn run(mut self) {
        info!("Schedule service started");
        'cycles: loop {
            self.run_cycle().await;
            let next = next_check_time(self.ctx.clock.now(), &self.ctx.config.schedule_check);
            info!(next = %next, "Next schedule check");

            loop {
                let remaining = (next - self.ctx.clock.now()).to_std().unwrap_or_default();
                tokio::select! {
                    _ = self.shutdown.cancelled() => break 'cycles,
                    _ = tokio::time::sleep(remaining) => continue 'cycles,
                    Some(command) = self.commands.recv() => {
                        if self.handle_command(command).await {
                            self.admit();
                        }
                    }
                    Some(finished) = self.recordings.join_next(), if !self.recordings.is_empty() => {
                        match finished {
                            Ok(phase) => debug!(%phase, "Recording task finished"),
                            Err(e) => error!("Recording task panicked: {}", e),
                        }
                        self.admit();
                    }
                }
            }
        }

        self.shutdown_recordings().await;
    }

    async fn shutdown_recordings(&mut self) {
        info!(active = self.recordings.len(), "Stopping recordings");
        for job in self.registry.jobs() {
            if !job.phase().is_terminal() {
                job.cancel();
            }
        }
        while let Some(finished) = self.recordings.join_next().await {
            if let Err(e) = finished {
                error!("Recording task panicked: {}", e);
            }
        }
        if let Some(retention) = self.retention.take() {
            retention.abort();
        }
        info!("Schedule service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(day: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, day)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn test_next_check_time_same_day() {
        assert_eq!(next_check_time(at(9, 6, 30), &[19, 1, 7, 13]), at(9, 7, 0));
        assert_eq!(next_check_time(at(9, 7, 0), &[1, 7, 13, 19]), at(9, 13, 0));
    }

    #[test]
    fn test_next_check_time_rolls_over() {
        assert_eq!(next_check_time(at(9, 20, 0), &[1, 7, 13, 19]), at(10, 1, 0));
        assert_eq!(next_check_time(at(9, 20, 0), &[]), at(9, 21, 0));
    }
}
