//! Per-job control loop.
//!
//! A spawned orchestrator sleeps until its job starts, authenticates, picks a
//! source and then drives capture segments until the show ends, retries run
//! out or the job is cancelled. Errors escaping the loop fail only this job.

use std::sync::Arc;

use chrono::{Duration, NaiveDateTime};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::auth::{AccessToken, Authenticator};
use crate::config::RecorderConfig;
use crate::connectivity::ConnectivityProbe;
use crate::domain::{JobPhase, RecordingJob, ServerChannelPair};
use crate::downloader::{
    CaptureRequest, CaptureRunner, CommandValues, SourceRanker, build_capture_args,
};
use crate::history::ChannelHistoryStore;
use crate::notification::{NotificationKind, NotificationService};
use crate::pipeline::{CaptureMetadata, VideoPipeline};
use crate::recorder::segments::SegmentSet;
use crate::schedule::ScheduleSource;
use crate::scheduler::registry::channels_for;
use crate::utils::Clock;
use crate::{Error, Result};

/// Longest uninterrupted sleep while waiting for a start time.
const MAX_WAIT_SLICE: std::time::Duration = std::time::Duration::from_secs(3600);

/// Shared collaborators handed to every orchestrator.
#[derive(Clone)]
pub struct RecorderContext {
    pub config: Arc<RecorderConfig>,
    pub history: Arc<ChannelHistoryStore>,
    pub authenticator: Arc<dyn Authenticator>,
    pub schedule: Arc<dyn ScheduleSource>,
    pub capture: Arc<dyn CaptureRunner>,
    pub connectivity: Arc<dyn ConnectivityProbe>,
    pub pipeline: Arc<dyn VideoPipeline>,
    pub notifier: NotificationService,
    pub clock: Arc<dyn Clock>,
}

/// How the capture loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureEnd {
    Complete,
    Cancelled,
    RetriesExhausted,
    /// The network stayed down until the show ended.
    NetworkLost,
}

impl CaptureEnd {
    fn partial_reason(self) -> Option<&'static str> {
        match self {
            Self::Complete => None,
            Self::Cancelled => Some("cancelled"),
            Self::RetriesExhausted => Some("too many retries"),
            Self::NetworkLost => Some("network outage"),
        }
    }
}

fn hours_between(from: NaiveDateTime, to: NaiveDateTime) -> f64 {
    (to - from).num_seconds().max(0) as f64 / 3600.0
}

/// History figures of the last segment not yet written to the store.
#[derive(Debug, Clone, Copy)]
struct PendingStats {
    hours: f64,
    kbps: i64,
}

/// Drives one job from `Waiting` to a terminal phase.
pub struct RecordingOrchestrator {
    ctx: RecorderContext,
    job: Arc<RecordingJob>,
    epoch: u64,
}

impl RecordingOrchestrator {
    /// Claim `job` for a new orchestrator, moving it to `Waiting`.
    pub fn new(ctx: RecorderContext, job: Arc<RecordingJob>) -> Result<Self> {
        let epoch = job.mark_spawned()?;
        Ok(Self { ctx, job, epoch })
    }

    /// Claim `job` and run its control loop on a new task.
    ///
    /// The handle resolves to the phase the job ended in.
    pub fn spawn(ctx: RecorderContext, job: Arc<RecordingJob>) -> Result<JoinHandle<JobPhase>> {
        Ok(tokio::spawn(Self::new(ctx, job)?.run()))
    }

    /// Run the control loop to completion, returning the final phase.
    pub async fn run(self) -> JobPhase {
        let span = info_span!(
            "job",
            show = %self.job.description(),
            start = %self.job.start().format("%Y-%m-%d %H:%M"),
        );
        self.drive().instrument(span).await
    }

    async fn drive(self) -> JobPhase {
        if let Err(e) = self.execute().await {
            error!("Recording failed: {}", e);
            if !matches!(e, Error::ShowVanished { .. }) {
                self.ctx.notifier.notify_job(
                    NotificationKind::JobFailed,
                    &self.job,
                    Some(e.to_string()),
                );
            }
            if let Err(transition) = self.job.transition_to(JobPhase::Failed) {
                warn!("Could not mark job as failed: {}", transition);
            }
        }
        self.job.phase()
    }

    async fn execute(&self) -> Result<()> {
        if !self.wait_for_start().await {
            return Ok(());
        }
        info!("Show is starting");

        let mut token = self.ctx.authenticator.authenticate(self.ctx.clock.now()).await?;
        self.job.transition_to(JobPhase::SourceSelection)?;
        let ranker = self.select_sources().await?;

        self.job.transition_to(JobPhase::Capturing)?;
        self.capture(ranker, &mut token).await
    }

    /// Sleep until the start time. Returns `false` when the job was
    /// cancelled or lost its slot before starting.
    async fn wait_for_start(&self) -> bool {
        let cancel = self.job.cancellation_token().clone();
        loop {
            if cancel.is_cancelled() {
                if self.job.transition_if(JobPhase::Waiting, JobPhase::Cancelled) {
                    info!("Cancelled before start");
                }
                return false;
            }
            if !self.job.owns_spawn(self.epoch) || self.job.phase() != JobPhase::Waiting {
                info!(phase = %self.job.phase(), "Recording slot revoked before start");
                return false;
            }

            let now = self.ctx.clock.now();
            let start = self.job.start();
            if now >= start {
                return self.job.begin_capture(self.epoch);
            }

            let remaining = (start - now)
                .to_std()
                .unwrap_or_default()
                .min(MAX_WAIT_SLICE);
            debug!(seconds = remaining.as_secs(), "Waiting for start");
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                _ = self.job.wake_signal().notified() => {
                    debug!("Woken while waiting");
                }
                _ = cancel.cancelled() => {}
            }
        }
    }

    /// Re-read the job's channels from the live schedule and rank them.
    async fn select_sources(&self) -> Result<SourceRanker> {
        let details = self.job.details();
        let shows = self.ctx.schedule.fetch_shows().await?;
        let channels = channels_for(&shows, &details.description, &details.window.raw_start);
        if channels.is_empty() {
            self.ctx.notifier.notify_job(NotificationKind::ShowVanished, &self.job, None);
            return Err(Error::ShowVanished {
                description: details.description,
                start: details.window.raw_start,
            });
        }
        self.job.set_channels(channels.clone());

        let ranker = SourceRanker::new(
            &channels,
            &details.preferences,
            &self.ctx.config.servers(),
            &self.ctx.history,
        );
        info!(candidates = ranker.pairs().len(), "Ranked capture sources");
        Ok(ranker)
    }

    async fn capture(&self, mut ranker: SourceRanker, token: &mut AccessToken) -> Result<()> {
        let ctx = &self.ctx;
        let config = &ctx.config;
        let details = self.job.details();
        let cancel = self.job.cancellation_token().clone();
        let target_end = self.job.end();
        let slack = Duration::minutes(config.alignment_slack_minutes);
        let stable_after = Duration::minutes(config.stable_pair_minutes);
        let mut segments = SegmentSet::new(&config.output_path, &details.file_name);

        let mut pair = ranker
            .current()
            .cloned()
            .ok_or_else(|| Error::Capture("no capture sources".to_string()))?;
        ctx.history.record_attempt(&pair.channel.number);

        let mut retries = 0;
        let mut announced = false;
        let (end, pending) = loop {
            let segment_start = ctx.clock.now();
            let output_path = segments.next_segment().await?;
            let args = build_capture_args(
                &config.capture_cmd_line,
                CommandValues {
                    server: &pair.server,
                    channel: &pair.channel.number,
                    auth_token: &token.value,
                    output_path: &output_path,
                },
            );

            if !announced {
                announced = true;
                if self.job.wants_email() {
                    ctx.notifier
                        .notify_job(NotificationKind::CaptureStarted, &self.job, None);
                }
            }

            info!(
                server = %pair.server,
                channel = %pair.channel.number,
                segment = %output_path.display(),
                "Starting capture"
            );
            let result = ctx
                .capture
                .run(CaptureRequest {
                    program: config.ffmpeg_path.clone(),
                    args,
                    output_path,
                    log_path: Some(config.job_log_path(&details.file_name)),
                    time_limit: Some(
                        (target_end + slack - segment_start)
                            .to_std()
                            .unwrap_or_default(),
                    ),
                    acceptable_rate: config.acceptable_rate,
                    health_check_interval: config.health_check_interval(),
                    cancel: cancel.clone(),
                })
                .await?;

            let now = ctx.clock.now();
            info!(
                exit_code = ?result.exit_code,
                kbps = result.avg_kbps,
                reason = ?result.stop_reason.map(|r| r.to_string()),
                "Capture segment ended"
            );

            let stats = PendingStats {
                hours: hours_between(segment_start, now),
                kbps: result.avg_kbps,
            };
            if cancel.is_cancelled() {
                break (CaptureEnd::Cancelled, Some(stats));
            }
            if now >= target_end {
                break (CaptureEnd::Complete, Some(stats));
            }
            if retries >= config.number_of_retries {
                warn!(retries, "Giving up after repeated failures");
                break (CaptureEnd::RetriesExhausted, Some(stats));
            }

            self.job.transition_to(JobPhase::RetryDecision)?;
            ctx.history
                .update_throughput(&pair.channel.number, &pair.server, result.avg_kbps);
            ctx.history.record_hours(&pair.channel.number, stats.hours);

            if now - segment_start < stable_after {
                ranker.record_observed_throughput(result.avg_kbps);
                if ranker.is_best_selected() {
                    retries += 1;
                } else {
                    ranker.advance();
                    retries = 0;
                }
            } else {
                retries = 0;
            }

            if !self.wait_for_connectivity(target_end).await {
                break (CaptureEnd::Cancelled, None);
            }
            let now = ctx.clock.now();
            if now >= target_end {
                warn!("Show ended while the network was down");
                break (CaptureEnd::NetworkLost, None);
            }

            if token.is_expired(now, config.auth_minutes) {
                info!("Access token expired, re-authenticating");
                *token = ctx.authenticator.authenticate(now).await?;
            }

            let next = ranker
                .current()
                .cloned()
                .ok_or_else(|| Error::Capture("no capture sources".to_string()))?;
            if next.server != pair.server || next.channel.number != pair.channel.number {
                ctx.history.record_attempt(&next.channel.number);
                pair = next;
            }
            info!(retries, pair = %pair, "Retrying capture");
            self.job.transition_to(JobPhase::Capturing)?;
        };

        self.finalize(end, &pair, pending, segments).await
    }

    /// Block until the probe reports the network is back or `until` passes.
    /// Returns `false` if the job is cancelled meanwhile.
    async fn wait_for_connectivity(&self, until: NaiveDateTime) -> bool {
        let cancel = self.job.cancellation_token();
        let mut warned = false;
        while self.ctx.clock.now() < until && !self.ctx.connectivity.is_online().await {
            if !warned {
                warn!("Network is down, waiting for it to recover");
                warned = true;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.ctx.config.connectivity_check_interval()) => {}
                _ = cancel.cancelled() => return false,
            }
        }
        if warned {
            info!("Network is back");
        }
        !cancel.is_cancelled()
    }

    async fn finalize(
        &self,
        end: CaptureEnd,
        pair: &ServerChannelPair,
        pending: Option<PendingStats>,
        segments: SegmentSet,
    ) -> Result<()> {
        let ctx = &self.ctx;
        self.job.transition_to(JobPhase::Finalizing)?;

        let hours = match pending {
            Some(stats) => {
                ctx.history
                    .update_throughput(&pair.channel.number, &pair.server, stats.kbps);
                stats.hours
            }
            None => 0.0,
        };
        ctx.history.record_success(&pair.channel.number, hours);
        if let Err(e) = ctx.history.save().await {
            warn!("Failed to save channel history: {}", e);
        }

        match end.partial_reason() {
            Some(reason) => {
                self.job.transition_to(JobPhase::Partial)?;
                info!(reason, "Capture ended early");
                ctx.notifier.notify_job(
                    NotificationKind::Partial,
                    &self.job,
                    Some(reason.to_string()),
                );
            }
            None => {
                self.job.transition_to(JobPhase::Completed)?;
                info!("Capture completed");
            }
        }

        let written = segments.written().await;
        if written.is_empty() {
            warn!("No capture segments were written");
        } else {
            let details = self.job.details();
            let metadata = CaptureMetadata {
                description: details.description,
                category: details.category,
                offset_seconds: details.window.pre_minutes * 60,
            };
            if let Err(e) = ctx.pipeline.process(written, metadata).await {
                warn!("Post-processing failed: {}", e);
            }
        }

        if self.job.wants_email() {
            ctx.notifier
                .notify_job(NotificationKind::CaptureReady, &self.job, None);
        }
        Ok(())
    }
}
