//! Removal of old captures and job logs.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDateTime};
use tracing::{debug, info, warn};

use crate::Result;
use crate::config::RecorderConfig;
use crate::utils::fs::{io_error, remove_file_with_retry};

/// Deletion attempts for a file that is still held open.
const DELETE_ATTEMPTS: u32 = 13;
/// Pause between deletion attempts.
const DELETE_BACKOFF: Duration = Duration::from_secs(15 * 60);

/// Which files in a directory are subject to retention.
#[derive(Debug, Clone, Copy)]
pub enum FileKind {
    /// Capture segments and their derived videos and thumbnails.
    Capture,
    /// Per-job capture tool logs.
    JobLog,
}

impl FileKind {
    pub fn matches(self, file_name: &str) -> bool {
        let lower = file_name.to_ascii_lowercase();
        match self {
            Self::Capture => [".ts", ".mp4", ".png"].iter().any(|ext| lower.ends_with(ext)),
            Self::JobLog => lower.ends_with("log.txt"),
        }
    }
}

/// Delete captures and job logs last modified before `now - retention_days`.
/// Returns how many files were removed.
pub async fn clean_old_files(config: &RecorderConfig, now: NaiveDateTime) -> usize {
    clean_old_files_with_backoff(config, now, DELETE_BACKOFF).await
}

pub(crate) async fn clean_old_files_with_backoff(
    config: &RecorderConfig,
    now: NaiveDateTime,
    backoff: Duration,
) -> usize {
    let cutoff = now - chrono::Duration::days(config.retention_days as i64);
    info!(%cutoff, "Removing captures and logs older than the cutoff");

    let mut removed = 0;
    for (dir, kind) in [
        (config.log_path.as_path(), FileKind::JobLog),
        (config.output_path.as_path(), FileKind::Capture),
    ] {
        match remove_older_than(dir, kind, cutoff, backoff).await {
            Ok(count) => removed += count,
            Err(e) => warn!(dir = %dir.display(), "Problem cleaning up old files: {}", e),
        }
    }
    removed
}

async fn remove_older_than(
    dir: &Path,
    kind: FileKind,
    cutoff: NaiveDateTime,
    backoff: Duration,
) -> Result<usize> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(io_error("reading directory", dir, e)),
    };

    let mut removed = 0;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| io_error("reading directory", dir, e))?
    {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if !kind.matches(&name) {
            continue;
        }
        let metadata = match entry.metadata().await {
            Ok(metadata) if metadata.is_file() => metadata,
            _ => continue,
        };
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        let modified = DateTime::<Local>::from(modified).naive_local();
        if modified >= cutoff {
            continue;
        }

        debug!(path = %path.display(), %modified, "Deleting old file");
        remove_file_with_retry(&path, DELETE_ATTEMPTS, backoff).await?;
        removed += 1;
    }
    Ok(removed)
}
