//! Fake collaborators shared by the integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use stream_capture::Result;
use stream_capture::auth::{AccessToken, Authenticator};
use stream_capture::config::RecorderConfig;
use stream_capture::connectivity::{AlwaysOnline, ConnectivityProbe};
use stream_capture::domain::ShowEntry;
use stream_capture::downloader::{CaptureRequest, CaptureResult, CaptureRunner, StopReason};
use stream_capture::history::ChannelHistoryStore;
use stream_capture::keywords::{KeywordRule, KeywordRules};
use stream_capture::notification::{NotificationChannel, NotificationEvent, NotificationService};
use stream_capture::pipeline::PassthroughPipeline;
use stream_capture::recorder::RecorderContext;
use stream_capture::schedule::ScheduleSource;
use stream_capture::utils::{Clock, ManualClock};

pub fn at(h: u32, m: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, 9)
        .unwrap()
        .and_hms_opt(h, m, 0)
        .unwrap()
}

pub fn show(id: &str, name: &str, start: &str, end: &str) -> ShowEntry {
    ShowEntry {
        id: id.to_string(),
        name: name.to_string(),
        start: start.to_string(),
        end_time: end.to_string(),
        runtime_minutes: 60,
        category: "Soccer".to_string(),
        channel: "1".to_string(),
        quality: "HD".to_string(),
        language: "English".to_string(),
    }
}

pub fn rules(keywords: &[&str]) -> KeywordRules {
    let rules = keywords
        .iter()
        .map(|keyword| KeywordRule {
            name: keyword.to_string(),
            keywords: vec![keyword.to_string()],
            ..Default::default()
        })
        .collect();
    KeywordRules::new(rules).unwrap()
}

/// Serves a fixed feed.
pub struct FixedSchedule(pub Mutex<Vec<ShowEntry>>);

impl FixedSchedule {
    pub fn new(shows: Vec<ShowEntry>) -> Self {
        Self(Mutex::new(shows))
    }
}

#[async_trait]
impl ScheduleSource for FixedSchedule {
    async fn fetch_shows(&self) -> Result<Vec<ShowEntry>> {
        Ok(self.0.lock().clone())
    }
}

pub struct StaticAuth;

#[async_trait]
impl Authenticator for StaticAuth {
    async fn authenticate(&self, now: NaiveDateTime) -> Result<AccessToken> {
        Ok(AccessToken {
            value: "token".to_string(),
            obtained_at: now,
        })
    }
}

/// Pretends every capture dies after `segment` of wall-clock time.
pub struct ShortCapture {
    pub clock: Arc<ManualClock>,
    pub segment: chrono::Duration,
    pub kbps: i64,
    pub runs: AtomicUsize,
    /// Cancel the job from inside this run (1-based).
    pub cancel_on_run: Option<usize>,
    pub time_limits: Mutex<Vec<Option<std::time::Duration>>>,
}

impl ShortCapture {
    pub fn new(clock: Arc<ManualClock>, segment_minutes: i64) -> Self {
        Self {
            clock,
            segment: chrono::Duration::minutes(segment_minutes),
            kbps: 400,
            runs: AtomicUsize::new(0),
            cancel_on_run: None,
            time_limits: Mutex::new(Vec::new()),
        }
    }

    pub fn cancelling_on(mut self, run: usize) -> Self {
        self.cancel_on_run = Some(run);
        self
    }

    pub fn time_limits(&self) -> Vec<Option<std::time::Duration>> {
        self.time_limits.lock().clone()
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureRunner for ShortCapture {
    async fn run(&self, request: CaptureRequest) -> Result<CaptureResult> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        self.time_limits.lock().push(request.time_limit);
        tokio::fs::write(&request.output_path, b"segment").await?;
        self.clock.advance(self.segment);
        let stop_reason = if self.cancel_on_run == Some(run) {
            request.cancel.cancel();
            Some(StopReason::Cancelled)
        } else {
            None
        };
        Ok(CaptureResult {
            exit_code: Some(1),
            avg_kbps: self.kbps,
            stop_reason,
        })
    }
}

/// Reports the network down once, moving the clock to `back_at` while it is.
pub struct OutageUntil {
    pub clock: Arc<ManualClock>,
    pub back_at: NaiveDateTime,
    pub checks: AtomicUsize,
}

impl OutageUntil {
    pub fn new(clock: Arc<ManualClock>, back_at: NaiveDateTime) -> Self {
        Self {
            clock,
            back_at,
            checks: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ConnectivityProbe for OutageUntil {
    async fn is_online(&self) -> bool {
        if self.checks.fetch_add(1, Ordering::SeqCst) == 0 {
            self.clock.set(self.back_at);
            return false;
        }
        true
    }
}

/// Forwards every notification to a channel.
pub struct RecordingChannel(pub mpsc::UnboundedSender<NotificationEvent>);

#[async_trait]
impl NotificationChannel for RecordingChannel {
    fn channel_type(&self) -> &'static str {
        "recording"
    }

    fn is_enabled(&self) -> bool {
        true
    }

    async fn send(&self, event: &NotificationEvent) -> Result<()> {
        let _ = self.0.send(event.clone());
        Ok(())
    }
}

pub fn config(dir: &Path) -> RecorderConfig {
    RecorderConfig {
        server_list: "s1".to_string(),
        number_of_retries: 1,
        concurrent_captures: 1,
        additional_starred_captures: 0,
        output_path: dir.join("captures"),
        log_path: dir.join("logs"),
        history_path: dir.join("channelhistory.json"),
        ..Default::default()
    }
}

pub fn context(
    config: RecorderConfig,
    clock: Arc<ManualClock>,
    schedule: Arc<dyn ScheduleSource>,
    capture: Arc<dyn CaptureRunner>,
    events: mpsc::UnboundedSender<NotificationEvent>,
) -> RecorderContext {
    let clock_dyn: Arc<dyn Clock> = clock;
    RecorderContext {
        history: Arc::new(ChannelHistoryStore::new(
            &config.history_path,
            Arc::clone(&clock_dyn),
        )),
        config: Arc::new(config),
        authenticator: Arc::new(StaticAuth),
        schedule,
        capture,
        connectivity: Arc::new(AlwaysOnline),
        pipeline: Arc::new(PassthroughPipeline),
        notifier: NotificationService::with_channels(vec![Arc::new(RecordingChannel(events))]),
        clock: clock_dyn,
    }
}
