//! `RecorderConfig` definition, loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::notification::NotificationServiceConfig;
use crate::{Error, Result};

/// Environment variable overriding the upstream user name.
pub const ENV_USER: &str = "STREAM_CAPTURE_USER";
/// Environment variable overriding the upstream password.
pub const ENV_PASS: &str = "STREAM_CAPTURE_PASS";
/// Environment variable overriding the capture tool binary.
pub const ENV_FFMPEG_PATH: &str = "FFMPEG_PATH";

/// How far ahead of now the admission scheduler looks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawFutureWindow", into = "RawFutureWindow")]
pub enum FutureWindow {
    /// A fixed number of hours past now.
    Hours(u32),
    /// Until the end of the current day.
    Today,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawFutureWindow {
    Hours(u32),
    Text(String),
}

impl TryFrom<RawFutureWindow> for FutureWindow {
    type Error = String;

    fn try_from(raw: RawFutureWindow) -> std::result::Result<Self, Self::Error> {
        match raw {
            RawFutureWindow::Hours(h) => Ok(Self::Hours(h)),
            RawFutureWindow::Text(s) if s.trim().eq_ignore_ascii_case("today") => Ok(Self::Today),
            RawFutureWindow::Text(s) => s
                .trim()
                .parse()
                .map(Self::Hours)
                .map_err(|_| format!("hours_in_future must be a number or \"today\", got {s:?}")),
        }
    }
}

impl From<FutureWindow> for RawFutureWindow {
    fn from(value: FutureWindow) -> Self {
        match value {
            FutureWindow::Hours(h) => Self::Hours(h),
            FutureWindow::Today => Self::Text("today".to_string()),
        }
    }
}

/// All recorder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Upstream account name.
    pub user: String,
    /// Upstream account password.
    pub pass: String,
    /// Token endpoint; `[USERNAME]` and `[PASSWORD]` are substituted.
    pub auth_url: String,
    /// Token lifetime in minutes before a retry re-authenticates.
    pub auth_minutes: u32,
    /// Schedule feed URL.
    pub schedule_url: String,
    /// Read the schedule from this file instead of `schedule_url`.
    pub schedule_file: Option<PathBuf>,
    /// Feeds with fewer channel entries than this are treated as broken.
    pub min_schedule_channels: usize,
    /// Hours of the day at which the schedule is re-read.
    pub schedule_check: Vec<u32>,
    /// Admission look-ahead.
    pub hours_in_future: FutureWindow,
    /// Shift applied to feed times to get local time.
    pub schedule_time_offset_hours: i32,
    /// Maximum concurrent captures.
    pub concurrent_captures: usize,
    /// Extra concurrent slots available to starred shows.
    pub additional_starred_captures: usize,
    /// Retries without progress before a capture is abandoned as partial.
    pub number_of_retries: u32,
    /// Output growth at or below this rate (KB/s) kills the capture.
    pub acceptable_rate: i64,
    /// Seconds between health checks of a running capture.
    pub health_check_interval_secs: u64,
    /// A pair that survives this long is considered stable.
    pub stable_pair_minutes: i64,
    /// Slack added to capture deadlines.
    pub alignment_slack_minutes: i64,
    /// Seconds between connectivity probes while the network is down.
    pub connectivity_check_secs: u64,
    /// URL probed for connectivity; no probe when unset.
    pub connectivity_url: Option<String>,
    /// Queued shows longer than this raise a warning.
    pub long_show_hours: i64,
    /// Comma separated server ids, tried in order within a channel.
    pub server_list: String,
    /// Capture arguments with `[SERVER]`, `[CHANNEL]`, `[AUTHTOKEN]` and
    /// `[FULLOUTPUTPATH]` placeholders.
    pub capture_cmd_line: String,
    /// Capture tool binary.
    pub ffmpeg_path: String,
    /// Directory receiving capture segments.
    pub output_path: PathBuf,
    /// Directory receiving application and per-job logs.
    pub log_path: PathBuf,
    /// Persisted channel history.
    pub history_path: PathBuf,
    /// Ordered keyword rules.
    pub keywords_path: PathBuf,
    /// Captures and logs older than this many days are deleted.
    pub retention_days: u32,
    /// Notification delivery.
    pub notification: NotificationServiceConfig,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            user: String::new(),
            pass: String::new(),
            auth_url: String::new(),
            auth_minutes: 240,
            schedule_url: String::new(),
            schedule_file: None,
            min_schedule_channels: 5,
            schedule_check: vec![1, 7, 13, 19],
            hours_in_future: FutureWindow::Hours(24),
            schedule_time_offset_hours: 0,
            concurrent_captures: 2,
            additional_starred_captures: 1,
            number_of_retries: 3,
            acceptable_rate: 50,
            health_check_interval_secs: 10,
            stable_pair_minutes: 15,
            alignment_slack_minutes: 1,
            connectivity_check_secs: 60,
            connectivity_url: None,
            long_show_hours: 4,
            server_list: String::new(),
            capture_cmd_line: "-hide_banner -i http://[SERVER]/ch[CHANNEL].m3u8?wmsAuthSign=[AUTHTOKEN] -c copy [FULLOUTPUTPATH]".to_string(),
            ffmpeg_path: "ffmpeg".to_string(),
            output_path: PathBuf::from("captures"),
            log_path: PathBuf::from("logs"),
            history_path: PathBuf::from("channelhistory.json"),
            keywords_path: PathBuf::from("keywords.json"),
            retention_days: 7,
            notification: NotificationServiceConfig::default(),
        }
    }
}

impl RecorderConfig {
    /// Load from a JSON file, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::io_path("reading config", path, e))?;
        let mut config: Self = serde_json::from_str(&text)?;
        config.apply_env_overrides();
        config.validate()?;
        debug!(path = %path.display(), "Loaded recorder configuration");
        Ok(config)
    }

    /// Credentials and tool paths from the environment win over the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(user) = std::env::var(ENV_USER) {
            self.user = user;
        }
        if let Ok(pass) = std::env::var(ENV_PASS) {
            self.pass = pass;
        }
        if let Ok(ffmpeg) = std::env::var(ENV_FFMPEG_PATH) {
            self.ffmpeg_path = ffmpeg;
        }
    }

    /// Range-check settings that would otherwise fail late.
    pub fn validate(&self) -> Result<()> {
        check_range("concurrent_captures", self.concurrent_captures as i64, 1, 25)?;
        check_range(
            "additional_starred_captures",
            self.additional_starred_captures as i64,
            0,
            25,
        )?;
        check_range("auth_minutes", self.auth_minutes as i64, 30, 1440)?;
        check_range("number_of_retries", self.number_of_retries as i64, 1, 50)?;
        check_range("acceptable_rate", self.acceptable_rate, 1, 6_000_000)?;
        check_range(
            "schedule_time_offset_hours",
            self.schedule_time_offset_hours as i64,
            -12,
            12,
        )?;
        check_range("retention_days", self.retention_days as i64, 1, 120)?;
        check_range(
            "health_check_interval_secs",
            self.health_check_interval_secs as i64,
            1,
            600,
        )?;
        if let FutureWindow::Hours(h) = self.hours_in_future {
            check_range("hours_in_future", h as i64, 0, 48)?;
        }

        if self.schedule_check.is_empty() {
            return Err(Error::config("schedule_check must list at least one hour"));
        }
        for hour in &self.schedule_check {
            check_range("schedule_check", *hour as i64, 0, 23)?;
        }

        if self.capture_cmd_line.trim().is_empty() {
            return Err(Error::config("capture_cmd_line is not set"));
        }
        let wants_server = self.capture_cmd_line.contains("[SERVER]");
        match (self.servers().is_empty(), wants_server) {
            (true, true) => Err(Error::config(
                "server_list is empty but capture_cmd_line expects [SERVER]",
            )),
            (false, false) => Err(Error::config(
                "server_list has servers but capture_cmd_line has no [SERVER]",
            )),
            _ => Ok(()),
        }
    }

    /// Configured server ids in preference order.
    pub fn servers(&self) -> Vec<String> {
        self.server_list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Upper bound on start times considered for admission.
    pub fn future_cutoff(&self, now: NaiveDateTime) -> NaiveDateTime {
        match self.hours_in_future {
            FutureWindow::Hours(h) => now + chrono::Duration::hours(h as i64),
            FutureWindow::Today => {
                let end_of_day = NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN);
                now.date().and_time(end_of_day)
            }
        }
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }

    pub fn connectivity_check_interval(&self) -> Duration {
        Duration::from_secs(self.connectivity_check_secs.max(1))
    }

    /// Per-job log file receiving the capture tool's output.
    pub fn job_log_path(&self, file_name: &str) -> PathBuf {
        self.log_path.join(format!("{file_name}Log.txt"))
    }
}

fn check_range(name: &str, value: i64, lower: i64, upper: i64) -> Result<()> {
    if value < lower || value > upper {
        return Err(Error::config(format!(
            "'{name}' is invalid: {value} is not within {lower}..={upper}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn valid() -> RecorderConfig {
        RecorderConfig {
            server_list: "dnaw1, dnae2".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_with_servers_validate() {
        assert!(valid().validate().is_ok());
        assert_eq!(valid().servers(), vec!["dnaw1", "dnae2"]);
    }

    #[test]
    fn test_server_placeholder_mismatch_is_rejected() {
        let config = RecorderConfig::default();
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        let config = RecorderConfig {
            capture_cmd_line: "-i [CHANNEL] [FULLOUTPUTPATH]".to_string(),
            ..valid()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_out_of_range_values_are_rejected() {
        let config = RecorderConfig {
            concurrent_captures: 0,
            ..valid()
        };
        assert!(config.validate().is_err());

        let config = RecorderConfig {
            schedule_check: vec![7, 24],
            ..valid()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_future_window_parses_numbers_and_today() {
        let json = r#"{"hours_in_future": "today", "schedule_check": [6, 18]}"#;
        let config: RecorderConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.hours_in_future, FutureWindow::Today);
        assert_eq!(config.schedule_check, vec![6, 18]);

        let config: RecorderConfig = serde_json::from_str(r#"{"hours_in_future": "12"}"#).unwrap();
        assert_eq!(config.hours_in_future, FutureWindow::Hours(12));

        let config: RecorderConfig = serde_json::from_str(r#"{"hours_in_future": 6}"#).unwrap();
        assert_eq!(config.hours_in_future, FutureWindow::Hours(6));

        assert!(serde_json::from_str::<RecorderConfig>(r#"{"hours_in_future": "soon"}"#).is_err());
    }

    #[test]
    fn test_future_cutoff() {
        let mut config = valid();
        config.hours_in_future = FutureWindow::Hours(6);
        assert_eq!(config.future_cutoff(at(10, 0)), at(16, 0));

        config.hours_in_future = FutureWindow::Today;
        let cutoff = config.future_cutoff(at(10, 0));
        assert_eq!(cutoff, at(23, 59) + chrono::Duration::seconds(59));
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("appsettings.json");
        std::fs::write(
            &path,
            r#"{"server_list": "a,b", "concurrent_captures": 3, "number_of_retries": 5}"#,
        )
        .unwrap();

        let config = RecorderConfig::load(&path).unwrap();
        assert_eq!(config.concurrent_captures, 3);
        assert_eq!(config.number_of_retries, 5);
        assert_eq!(config.health_check_interval_secs, 10);
    }
}
