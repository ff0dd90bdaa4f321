//! Per-channel capture statistics.
//!
//! The store keeps one `ChannelHistoryRecord` per channel in a concurrent map
//! shared by every running job. Only `load` and `save` touch the history
//! file, and those are serialised by a single lock so that in-memory reads
//! never wait on disk I/O.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDateTime;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::utils::Clock;
use crate::utils::fs::ensure_parent_dir;
use crate::{Error, Result};

/// Capture statistics for one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelHistoryRecord {
    pub channel: String,
    pub hours_recorded: f64,
    pub recordings_attempted: i64,
    /// Smoothed throughput per server, in KB/s.
    #[serde(default)]
    pub server_speed: HashMap<String, i64>,
    pub last_attempt: NaiveDateTime,
    pub last_success: NaiveDateTime,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl ChannelHistoryRecord {
    fn new(channel: &str, now: NaiveDateTime) -> Self {
        Self {
            channel: channel.to_string(),
            hours_recorded: 0.0,
            recordings_attempted: 0,
            server_speed: HashMap::new(),
            last_attempt: now,
            last_success: now,
            active: true,
        }
    }
}

/// Shared channel history, persisted as JSON.
pub struct ChannelHistoryStore {
    path: PathBuf,
    records: DashMap<String, ChannelHistoryRecord>,
    file_lock: tokio::sync::Mutex<()>,
    clock: Arc<dyn Clock>,
}

impl ChannelHistoryStore {
    /// An empty store bound to `path`; nothing is read until `load`.
    pub fn new(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: path.into(),
            records: DashMap::new(),
            file_lock: tokio::sync::Mutex::new(()),
            clock,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the in-memory state with the file contents.
    ///
    /// A missing or unreadable file leaves the store empty.
    pub async fn load(&self) {
        let _guard = self.file_lock.lock().await;
        self.records.clear();

        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No channel history yet, starting empty");
                return;
            }
            Err(e) => {
                warn!(path = %self.path.display(), "Failed to read channel history: {}", e);
                return;
            }
        };

        match serde_json::from_str::<HashMap<String, ChannelHistoryRecord>>(&text) {
            Ok(map) => {
                debug!(channels = map.len(), "Loaded channel history");
                for (channel, record) in map {
                    self.records.insert(channel, record);
                }
            }
            Err(e) => {
                warn!(path = %self.path.display(), "Channel history is corrupt, starting empty: {}", e);
            }
        }
    }

    /// Copy of the record for `channel`, creating it if absent.
    pub fn get(&self, channel: &str) -> ChannelHistoryRecord {
        self.entry(channel, |_| {})
    }

    pub fn record_attempt(&self, channel: &str) {
        let now = self.clock.now();
        self.entry(channel, |record| {
            record.recordings_attempted += 1;
            record.last_attempt = now;
        });
    }

    /// Credit `hours` of capture to `channel` without marking a success.
    pub fn record_hours(&self, channel: &str, hours: f64) {
        self.entry(channel, |record| record.hours_recorded += hours);
    }

    pub fn record_success(&self, channel: &str, hours: f64) {
        let now = self.clock.now();
        self.entry(channel, |record| {
            record.hours_recorded += hours;
            record.last_success = now;
        });
    }

    /// Blend an observed rate into the server's estimate for `channel`.
    ///
    /// The first observation is stored as is; later ones are averaged with
    /// the prior estimate.
    pub fn update_throughput(&self, channel: &str, server: &str, observed_kbps: i64) {
        self.entry(channel, |record| {
            record
                .server_speed
                .entry(server.to_string())
                .and_modify(|prior| *prior = (observed_kbps + *prior) / 2)
                .or_insert(observed_kbps);
        });
    }

    /// Last known throughput of `server` on `channel`, 0 if never measured.
    pub fn throughput(&self, server: &str, channel: &str) -> i64 {
        self.records
            .get(channel)
            .and_then(|record| record.server_speed.get(server).copied())
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Rewrite the history file with the current state.
    ///
    /// The file is written next to its final location and renamed over it.
    pub async fn save(&self) -> Result<()> {
        let _guard = self.file_lock.lock().await;

        let snapshot: HashMap<String, ChannelHistoryRecord> = self
            .records
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let json = serde_json::to_vec_pretty(&snapshot)?;
        let path = self.path.clone();
        ensure_parent_dir(&path).await?;

        tokio::task::spawn_blocking(move || write_atomically(&path, &json))
            .await
            .map_err(|e| Error::Other(format!("History save task failed: {e}")))??;

        debug!(channels = snapshot.len(), "Saved channel history");
        Ok(())
    }

    fn entry<F>(&self, channel: &str, update: F) -> ChannelHistoryRecord
    where
        F: FnOnce(&mut ChannelHistoryRecord),
    {
        let mut record = self
            .records
            .entry(channel.to_string())
            .or_insert_with(|| ChannelHistoryRecord::new(channel, self.clock.now()));
        update(record.value_mut());
        record.clone()
    }
}

fn write_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut temp = tempfile::NamedTempFile::new_in(&dir)
        .map_err(|e| Error::io_path("creating temp file in", &dir, e))?;
    temp.write_all(contents)
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|e| Error::io_path("writing", temp.path(), e))?;
    temp.persist(path)
        .map_err(|e| Error::io_path("replacing", path, e.error))?;
    Ok(())
}
