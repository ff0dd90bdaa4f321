//! Supervision of one external capture process.
//!
//! The process runs until it exits on its own or a periodic health check
//! decides to stop it. Each tick checks, in order: the deadline, the job's
//! cancellation token, and the growth rate of the output file.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use process_utils::{kill_and_reap, tokio_command};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::utils::fs::ensure_parent_dir;
use crate::{Error, Result};

/// Everything needed to run one capture segment.
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub program: String,
    pub args: Vec<String>,
    pub output_path: PathBuf,
    /// Receives the process' stdout and stderr; discarded when `None`.
    pub log_path: Option<PathBuf>,
    /// How long the capture may run. No health check runs without one.
    pub time_limit: Option<Duration>,
    /// Growth at or below this many KB/s stops the capture.
    pub acceptable_rate: i64,
    pub health_check_interval: Duration,
    pub cancel: CancellationToken,
}

/// Why the health check stopped a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    DeadlineReached,
    Cancelled,
    MissingOutput,
    Stalled { kbps: i64 },
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeadlineReached => write!(f, "capture time is up"),
            Self::Cancelled => write!(f, "capture cancelled"),
            Self::MissingOutput => write!(f, "output file missing (bad feed)"),
            Self::Stalled { kbps } => write!(f, "feed stalled at {kbps}KB/s"),
        }
    }
}

/// Outcome of one capture segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureResult {
    pub exit_code: Option<i32>,
    /// Running average of the output growth rate in KB/s.
    pub avg_kbps: i64,
    pub stop_reason: Option<StopReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    Healthy,
    Stop(StopReason),
}

/// Health check state carried between ticks.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    interval_secs: i64,
    acceptable_rate: i64,
    last_size: u64,
    avg_kbps: i64,
}

impl HealthCheck {
    pub fn new(interval: Duration, acceptable_rate: i64) -> Self {
        Self {
            interval_secs: interval.as_secs().max(1) as i64,
            acceptable_rate,
            last_size: 0,
            avg_kbps: 0,
        }
    }

    pub fn avg_kbps(&self) -> i64 {
        self.avg_kbps
    }

    /// Evaluate one tick. `file_size` is `None` when the output file does not
    /// exist.
    pub fn evaluate(
        &mut self,
        deadline_reached: bool,
        cancelled: bool,
        file_size: Option<u64>,
    ) -> HealthVerdict {
        if deadline_reached {
            return HealthVerdict::Stop(StopReason::DeadlineReached);
        }
        if cancelled {
            return HealthVerdict::Stop(StopReason::Cancelled);
        }
        let Some(size) = file_size else {
            return HealthVerdict::Stop(StopReason::MissingOutput);
        };

        let grown = size as i64 - self.last_size as i64;
        let kbps = grown / self.interval_secs / 1000;
        if kbps <= self.acceptable_rate {
            return HealthVerdict::Stop(StopReason::Stalled { kbps });
        }

        self.avg_kbps = (kbps + self.avg_kbps) / 2;
        self.last_size = size;
        HealthVerdict::Healthy
    }
}

/// Runs capture segments.
#[async_trait]
pub trait CaptureRunner: Send + Sync {
    async fn run(&self, request: CaptureRequest) -> Result<CaptureResult>;
}

/// Spawns the capture tool and watches it.
#[derive(Debug, Default, Clone, Copy)]
pub struct CaptureSupervisor;

impl CaptureSupervisor {
    pub fn new() -> Self {
        Self
    }

    fn output_streams(log_path: Option<&Path>) -> Result<(Stdio, Stdio)> {
        let Some(path) = log_path else {
            return Ok((Stdio::null(), Stdio::null()));
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| Error::io_path("opening capture log", path, e))?;
        let err = file
            .try_clone()
            .map_err(|e| Error::io_path("opening capture log", path, e))?;
        Ok((Stdio::from(file), Stdio::from(err)))
    }
}

#[async_trait]
impl CaptureRunner for CaptureSupervisor {
    async fn run(&self, request: CaptureRequest) -> Result<CaptureResult> {
        if let Some(log_path) = &request.log_path {
            ensure_parent_dir(log_path).await?;
        }
        let (stdout, stderr) = Self::output_streams(request.log_path.as_deref())?;

        let mut cmd = tokio_command(&request.program);
        cmd.args(&request.args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            Error::Capture(format!("Failed to spawn {}: {e}", request.program))
        })?;
        info!(
            program = %request.program,
            output = %request.output_path.display(),
            limit = ?request.time_limit,
            "Capture process started"
        );

        let period = request.health_check_interval.max(Duration::from_secs(1));
        let deadline = request.time_limit.map(|limit| Instant::now() + limit);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut check = HealthCheck::new(period, request.acceptable_rate);
        let mut stop_reason = None;

        let exit_code = loop {
            tokio::select! {
                status = child.wait() => {
                    let status = status.map_err(|e| Error::Capture(format!("Failed waiting for capture: {e}")))?;
                    break status.code();
                }
                _ = ticker.tick(), if deadline.is_some() => {
                    let reached = deadline.is_some_and(|d| Instant::now() >= d);
                    let size = tokio::fs::metadata(&request.output_path)
                        .await
                        .ok()
                        .map(|m| m.len());

                    match check.evaluate(reached, request.cancel.is_cancelled(), size) {
                        HealthVerdict::Healthy => {
                            debug!(avg_kbps = check.avg_kbps(), "Capture healthy");
                        }
                        HealthVerdict::Stop(reason) => {
                            warn!(%reason, "Stopping capture process");
                            stop_reason = Some(reason);
                            break kill_and_reap(&mut child).await?;
                        }
                    }
                }
            }
        };

        info!(
            exit_code = ?exit_code,
            avg_kbps = check.avg_kbps(),
            "Capture process exited"
        );
        Ok(CaptureResult {
            exit_code,
            avg_kbps: check.avg_kbps(),
            stop_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_at_floor_stops() {
        let mut check = HealthCheck::new(Duration::from_secs(10), 50);
        assert_eq!(
            check.evaluate(false, false, Some(500_000)),
            HealthVerdict::Stop(StopReason::Stalled { kbps: 50 })
        );
    }

    #[test]
    fn test_rate_above_floor_continues_and_averages() {
        let mut check = HealthCheck::new(Duration::from_secs(10), 50);
        assert_eq!(check.evaluate(false, false, Some(510_000)), HealthVerdict::Healthy);
        assert_eq!(check.avg_kbps(), 25);

        assert_eq!(
            check.evaluate(false, false, Some(510_000 + 1_010_000)),
            HealthVerdict::Healthy
        );
        assert_eq!(check.avg_kbps(), (101 + 25) / 2);

        // no growth since the last tick
        assert_eq!(
            check.evaluate(false, false, Some(1_520_000)),
            HealthVerdict::Stop(StopReason::Stalled { kbps: 0 })
        );
    }

    #[test]
    fn test_check_order() {
        let mut check = HealthCheck::new(Duration::from_secs(10), 50);
        assert_eq!(
            check.evaluate(true, true, None),
            HealthVerdict::Stop(StopReason::DeadlineReached)
        );
        assert_eq!(
            check.evaluate(false, true, None),
            HealthVerdict::Stop(StopReason::Cancelled)
        );
        assert_eq!(
            check.evaluate(false, false, None),
            HealthVerdict::Stop(StopReason::MissingOutput)
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_output_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let request = CaptureRequest {
            program: "sleep".to_string(),
            args: vec!["30".to_string()],
            output_path: dir.path().join("never.ts"),
            log_path: Some(dir.path().join("captureLog.txt")),
            time_limit: Some(Duration::from_secs(60)),
            acceptable_rate: 1,
            health_check_interval: Duration::from_secs(1),
            cancel: CancellationToken::new(),
        };

        let started = std::time::Instant::now();
        let result = CaptureSupervisor::new().run(request).await.unwrap();
        assert_eq!(result.stop_reason, Some(StopReason::MissingOutput));
        assert_eq!(result.avg_kbps, 0);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancellation_stops_process_within_a_tick() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("live.ts");
        std::fs::write(&output, b"").unwrap();
        let cancel = CancellationToken::new();
        let request = CaptureRequest {
            program: "sleep".to_string(),
            args: vec!["60".to_string()],
            output_path: output,
            log_path: None,
            time_limit: Some(Duration::from_secs(60)),
            acceptable_rate: 0,
            health_check_interval: Duration::from_secs(1),
            cancel: cancel.clone(),
        };

        let started = std::time::Instant::now();
        let run = tokio::spawn(async move { CaptureSupervisor::new().run(request).await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();

        let result = run.await.unwrap().unwrap();
        assert_eq!(result.stop_reason, Some(StopReason::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    /// Writer that appends `bytes_per_tick` to `path` every `interval` seconds.
    #[cfg(unix)]
    fn steady_writer(path: &Path, bytes_per_tick: u64, interval: u64) -> Vec<String> {
        let script = format!(
            "while true; do head -c {bytes_per_tick} /dev/zero >> '{}'; sleep {interval}; done",
            path.display()
        );
        vec!["-c".to_string(), script]
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_writer_at_the_floor_is_stalled() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("slow.ts");
        let (floor, interval) = (2, 2);
        let request = CaptureRequest {
            program: "sh".to_string(),
            args: steady_writer(&output, floor * interval * 1000, interval),
            output_path: output,
            log_path: None,
            time_limit: Some(Duration::from_secs(60)),
            acceptable_rate: floor as i64,
            health_check_interval: Duration::from_secs(interval),
            cancel: CancellationToken::new(),
        };

        let result = tokio::time::timeout(
            Duration::from_secs(20),
            CaptureSupervisor::new().run(request),
        )
        .await
        .expect("stalled writer was not stopped")
        .unwrap();
        assert!(matches!(result.stop_reason, Some(StopReason::Stalled { kbps }) if kbps <= 2));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_writer_above_the_floor_keeps_running() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("fast.ts");
        let (floor, interval) = (2, 2);
        let cancel = CancellationToken::new();
        let request = CaptureRequest {
            program: "sh".to_string(),
            args: steady_writer(&output, (floor + 1) * interval * 1000, interval),
            output_path: output,
            log_path: None,
            time_limit: Some(Duration::from_secs(60)),
            acceptable_rate: floor as i64,
            health_check_interval: Duration::from_secs(interval),
            cancel: cancel.clone(),
        };

        let run = tokio::spawn(async move { CaptureSupervisor::new().run(request).await });
        // two health ticks pass before the stop request
        tokio::time::sleep(Duration::from_secs(2 * interval + 1)).await;
        assert!(!run.is_finished());

        cancel.cancel();
        let result = run.await.unwrap().unwrap();
        assert_eq!(result.stop_reason, Some(StopReason::Cancelled));
        assert!(result.avg_kbps > 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_exit_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let request = CaptureRequest {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "exit 3".to_string()],
            output_path: dir.path().join("out.ts"),
            log_path: None,
            time_limit: Some(Duration::from_secs(60)),
            acceptable_rate: 1,
            health_check_interval: Duration::from_secs(5),
            cancel: CancellationToken::new(),
        };

        let result = CaptureSupervisor::new().run(request).await.unwrap();
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.stop_reason, None);
    }
}
