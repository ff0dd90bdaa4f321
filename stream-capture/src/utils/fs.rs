//! Filesystem helpers shared across modules.
//!
//! These helpers provide consistent error context (operation + path) and
//! reduce duplicated `create_dir_all` / parent-directory checks.

use std::path::Path;
use std::time::Duration;

use tracing::warn;

use crate::{Error, Result};

/// Convert an IO error into an application error with operation + path context.
pub fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> Error {
    Error::io_path(op, path, source)
}

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all_with_op(op: &'static str, path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| io_error(op, path, e))
}

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all(path: &Path) -> Result<()> {
    ensure_dir_all_with_op("creating directory", path).await
}

/// Ensure the parent directory of a file path exists.
pub async fn ensure_parent_dir(path: &Path) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    ensure_dir_all_with_op("creating directory", parent).await
}

/// Delete a file, retrying while it is held open by another process.
///
/// A missing file counts as deleted. Any other failure is retried up to
/// `attempts` times with `backoff` between tries before it is returned.
pub async fn remove_file_with_retry(path: &Path, attempts: u32, backoff: Duration) -> Result<()> {
    let mut tries = 0;
    loop {
        match tokio::fs::remove_file(path).await {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) if tries < attempts => {
                tries += 1;
                warn!(
                    path = %path.display(),
                    error = %e,
                    "File is in use, retrying deletion ({}/{}) in {:?}",
                    tries,
                    attempts,
                    backoff
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(io_error("removing file", path, e)),
        }
    }
}
