//! Orchestrator runs against fake collaborators and a manual clock.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{OutageUntil, ShortCapture, at, config, context, show};
use stream_capture::domain::{
    ChannelOption, JobDetails, JobPhase, JobWindow, Preferences, RecordingJob,
};
use stream_capture::history::ChannelHistoryStore;
use stream_capture::notification::{NotificationEvent, NotificationKind};
use stream_capture::recorder::RecordingOrchestrator;
use stream_capture::utils::{Clock, ManualClock};
use tokio::sync::mpsc;

fn queued_job(name: &str, start: &str, end: &str) -> Arc<RecordingJob> {
    let details = JobDetails {
        id: "final".to_string(),
        description: name.to_string(),
        category: "Soccer".to_string(),
        window: JobWindow::new(start, end, 60, 0, 0, 0).unwrap(),
        preferences: Preferences::default(),
        rank: 0,
        channels: vec![ChannelOption::new("1", "HD", "English")],
        file_name: name.replace(' ', ""),
    };
    let job = Arc::new(RecordingJob::new(details, 0, false, false));
    job.transition_to(JobPhase::Queued).unwrap();
    job
}

async fn wait_for(
    rx: &mut mpsc::UnboundedReceiver<NotificationEvent>,
    kind: NotificationKind,
) -> NotificationEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("notifier closed");
            if event.kind == kind {
                return event;
            }
        }
    })
    .await
    .expect("notification not delivered")
}

#[tokio::test]
async fn test_early_exits_end_partial_after_retries() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(at(10, 0)));
    let capture = Arc::new(ShortCapture::new(Arc::clone(&clock), 5));
    let schedule = Arc::new(common::FixedSchedule::new(vec![show(
        "final",
        "Cup Final",
        "2024-03-09 10:00:00",
        "2024-03-09 11:00:00",
    )]));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let ctx = context(
        config(dir.path()),
        Arc::clone(&clock),
        schedule,
        capture.clone(),
        tx,
    );
    let history_path = ctx.config.history_path.clone();

    let job = queued_job("Cup Final", "2024-03-09 10:00:00", "2024-03-09 11:00:00");
    let handle = RecordingOrchestrator::spawn(ctx, Arc::clone(&job)).unwrap();
    assert_eq!(handle.await.unwrap(), JobPhase::Partial);

    let snapshot = job.snapshot();
    assert!(snapshot.completed);
    assert!(snapshot.partial);
    assert!(clock.now() < at(11, 0));
    // the first failure latches the only pair, then one retry is allowed on it
    assert_eq!(capture.runs(), 3);

    let event = wait_for(&mut rx, NotificationKind::Partial).await;
    assert_eq!(event.message.as_deref(), Some("too many retries"));

    let captures = dir.path().join("captures");
    assert!(captures.join("CupFinal.ts").exists());
    assert!(captures.join("CupFinal1.ts").exists());
    assert!(captures.join("CupFinal2.ts").exists());

    let reloaded = ChannelHistoryStore::new(&history_path, Arc::new(ManualClock::new(at(12, 0))));
    reloaded.load().await;
    let record = reloaded.get("01");
    assert_eq!(record.recordings_attempted, 1);
    assert_eq!(reloaded.throughput("s1", "01"), 400);
}

#[tokio::test]
async fn test_capture_reaching_the_end_completes() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(at(10, 0)));
    let capture = Arc::new(ShortCapture::new(Arc::clone(&clock), 61));
    let schedule = Arc::new(common::FixedSchedule::new(vec![show(
        "final",
        "Cup Final",
        "2024-03-09 10:00:00",
        "2024-03-09 11:00:00",
    )]));
    let (tx, _rx) = mpsc::unbounded_channel();
    let ctx = context(config(dir.path()), Arc::clone(&clock), schedule, capture.clone(), tx);

    let job = queued_job("Cup Final", "2024-03-09 10:00:00", "2024-03-09 11:00:00");
    let handle = RecordingOrchestrator::spawn(ctx, Arc::clone(&job)).unwrap();
    assert_eq!(handle.await.unwrap(), JobPhase::Completed);
    assert_eq!(capture.runs(), 1);
    assert!(!job.snapshot().partial);
}

#[tokio::test]
async fn test_cancel_while_waiting_never_captures() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(at(9, 0)));
    let capture = Arc::new(ShortCapture::new(Arc::clone(&clock), 5));
    let schedule = Arc::new(common::FixedSchedule::new(Vec::new()));
    let (tx, _rx) = mpsc::unbounded_channel();
    let ctx = context(config(dir.path()), Arc::clone(&clock), schedule, capture.clone(), tx);

    let job = queued_job("Cup Final", "2024-03-09 10:00:00", "2024-03-09 11:00:00");
    let handle = RecordingOrchestrator::spawn(ctx, Arc::clone(&job)).unwrap();
    assert_eq!(job.phase(), JobPhase::Waiting);

    tokio::task::yield_now().await;
    job.cancel();

    let phase = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("orchestrator did not stop")
        .unwrap();
    assert_eq!(phase, JobPhase::Cancelled);
    assert_eq!(capture.runs(), 0);
    assert!(!job.snapshot().process_spawned);
}

#[tokio::test]
async fn test_vanished_show_fails_the_job() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(at(10, 0)));
    let capture = Arc::new(ShortCapture::new(Arc::clone(&clock), 5));
    let schedule = Arc::new(common::FixedSchedule::new(Vec::new()));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let ctx = context(config(dir.path()), Arc::clone(&clock), schedule, capture.clone(), tx);

    let job = queued_job("Cup Final", "2024-03-09 10:00:00", "2024-03-09 11:00:00");
    let handle = RecordingOrchestrator::spawn(ctx, Arc::clone(&job)).unwrap();
    assert_eq!(handle.await.unwrap(), JobPhase::Failed);
    assert_eq!(capture.runs(), 0);
    wait_for(&mut rx, NotificationKind::ShowVanished).await;
}

fn final_schedule() -> Arc<common::FixedSchedule> {
    Arc::new(common::FixedSchedule::new(vec![show(
        "final",
        "Cup Final",
        "2024-03-09 10:00:00",
        "2024-03-09 11:00:00",
    )]))
}

#[tokio::test]
async fn test_latched_pair_gets_every_configured_retry() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(at(10, 0)));
    let capture = Arc::new(ShortCapture::new(Arc::clone(&clock), 5));
    let mut settings = config(dir.path());
    settings.number_of_retries = 2;
    let (tx, _rx) = mpsc::unbounded_channel();
    let ctx = context(settings, Arc::clone(&clock), final_schedule(), capture.clone(), tx);

    let job = queued_job("Cup Final", "2024-03-09 10:00:00", "2024-03-09 11:00:00");
    let handle = RecordingOrchestrator::spawn(ctx, Arc::clone(&job)).unwrap();
    assert_eq!(handle.await.unwrap(), JobPhase::Partial);
    assert_eq!(capture.runs(), 4);
}

#[tokio::test]
async fn test_zero_retries_stops_after_first_segment() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(at(10, 0)));
    let capture = Arc::new(ShortCapture::new(Arc::clone(&clock), 5));
    let mut settings = config(dir.path());
    settings.number_of_retries = 0;
    let (tx, _rx) = mpsc::unbounded_channel();
    let ctx = context(settings, Arc::clone(&clock), final_schedule(), capture.clone(), tx);

    let job = queued_job("Cup Final", "2024-03-09 10:00:00", "2024-03-09 11:00:00");
    let handle = RecordingOrchestrator::spawn(ctx, Arc::clone(&job)).unwrap();
    assert_eq!(handle.await.unwrap(), JobPhase::Partial);
    assert_eq!(capture.runs(), 1);
}

#[tokio::test]
async fn test_cancel_during_capture_keeps_segments() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(at(10, 0)));
    let capture = Arc::new(ShortCapture::new(Arc::clone(&clock), 5).cancelling_on(2));
    let mut settings = config(dir.path());
    settings.number_of_retries = 3;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let ctx = context(settings, Arc::clone(&clock), final_schedule(), capture.clone(), tx);

    let job = queued_job("Cup Final", "2024-03-09 10:00:00", "2024-03-09 11:00:00");
    let handle = RecordingOrchestrator::spawn(ctx, Arc::clone(&job)).unwrap();
    let phase = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("orchestrator did not stop")
        .unwrap();
    assert_eq!(phase, JobPhase::Partial);
    assert_eq!(capture.runs(), 2);

    let snapshot = job.snapshot();
    assert!(snapshot.completed);
    assert!(snapshot.partial);
    assert!(snapshot.cancelled);

    let event = wait_for(&mut rx, NotificationKind::Partial).await;
    assert_eq!(event.message.as_deref(), Some("cancelled"));

    let captures = dir.path().join("captures");
    assert!(captures.join("CupFinal.ts").exists());
    assert!(captures.join("CupFinal1.ts").exists());
}

#[tokio::test]
async fn test_outage_past_the_end_stops_without_new_segment() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(at(10, 0)));
    let capture = Arc::new(ShortCapture::new(Arc::clone(&clock), 5));
    let mut settings = config(dir.path());
    settings.connectivity_check_secs = 1;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut ctx = context(settings, Arc::clone(&clock), final_schedule(), capture.clone(), tx);
    ctx.connectivity = Arc::new(OutageUntil::new(Arc::clone(&clock), at(11, 30)));

    let job = queued_job("Cup Final", "2024-03-09 10:00:00", "2024-03-09 11:00:00");
    let handle = RecordingOrchestrator::spawn(ctx, Arc::clone(&job)).unwrap();
    let phase = tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("orchestrator did not stop")
        .unwrap();

    assert_eq!(phase, JobPhase::Partial);
    assert_eq!(capture.runs(), 1);
    assert!(capture.time_limits().iter().all(Option::is_some));

    let event = wait_for(&mut rx, NotificationKind::Partial).await;
    assert_eq!(event.message.as_deref(), Some("network outage"));
}

#[tokio::test]
async fn test_segment_started_after_the_end_gets_zero_limit() {
    let dir = tempfile::tempdir().unwrap();
    // the window is already over but the orchestrator still runs one segment
    let clock = Arc::new(ManualClock::new(at(11, 30)));
    let capture = Arc::new(ShortCapture::new(Arc::clone(&clock), 1));
    let (tx, _rx) = mpsc::unbounded_channel();
    let ctx = context(config(dir.path()), Arc::clone(&clock), final_schedule(), capture.clone(), tx);

    let job = queued_job("Cup Final", "2024-03-09 10:00:00", "2024-03-09 11:00:00");
    let handle = RecordingOrchestrator::spawn(ctx, Arc::clone(&job)).unwrap();
    assert_eq!(handle.await.unwrap(), JobPhase::Completed);
    assert_eq!(capture.time_limits(), vec![Some(Duration::ZERO)]);
}
