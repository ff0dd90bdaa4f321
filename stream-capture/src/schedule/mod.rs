//! Schedule feed access.
//!
//! The feed is a JSON object keyed by channel id; each value lists the shows
//! airing on that channel under `items`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Deserializer};
use tracing::{debug, warn};

use crate::domain::ShowEntry;
use crate::{Error, Result};

const FETCH_ATTEMPTS: u32 = 5;
const FETCH_RETRY_DELAY: Duration = Duration::from_secs(15);

/// Source of scheduled shows.
#[async_trait]
pub trait ScheduleSource: Send + Sync {
    async fn fetch_shows(&self) -> Result<Vec<ShowEntry>>;
}

#[derive(Debug, Deserialize)]
struct FeedChannel {
    #[serde(default)]
    items: Option<Vec<FeedShow>>,
}

#[derive(Debug, Deserialize)]
struct FeedShow {
    #[serde(default, deserialize_with = "lenient_string")]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    time: String,
    #[serde(default)]
    end_time: String,
    #[serde(default, deserialize_with = "lenient_minutes")]
    runtime: i64,
    #[serde(default)]
    category: String,
    #[serde(default, deserialize_with = "lenient_string")]
    channel: String,
    #[serde(default)]
    quality: String,
    #[serde(default)]
    language: String,
}

impl From<FeedShow> for ShowEntry {
    fn from(show: FeedShow) -> Self {
        Self {
            id: show.id,
            name: show.name,
            start: show.time,
            end_time: show.end_time,
            runtime_minutes: show.runtime,
            category: show.category,
            channel: show.channel,
            quality: show.quality,
            language: show.language,
        }
    }
}

fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    })
}

fn lenient_minutes<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<i64, D::Error> {
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Number(n) => n.as_i64().unwrap_or_default(),
        serde_json::Value::String(s) => s.trim().parse().unwrap_or_default(),
        _ => 0,
    })
}

/// Parse a feed document into shows, rejecting feeds with fewer than
/// `min_channels` channel entries.
pub fn parse_feed(text: &str, min_channels: usize) -> Result<Vec<ShowEntry>> {
    let channels: BTreeMap<String, FeedChannel> = serde_json::from_str(text)?;
    if channels.len() < min_channels {
        return Err(Error::Other(format!(
            "Schedule feed lists {} channels, expected at least {min_channels}",
            channels.len()
        )));
    }

    let shows = channels
        .into_values()
        .filter_map(|channel| channel.items)
        .flatten()
        .map(ShowEntry::from)
        .collect();
    Ok(shows)
}

/// Reads the feed over HTTP, or from a local file when one is configured.
pub struct HttpScheduleSource {
    client: Client,
    url: String,
    file: Option<PathBuf>,
    min_channels: usize,
    retry_delay: Duration,
}

impl HttpScheduleSource {
    pub fn new(url: impl Into<String>, file: Option<PathBuf>, min_channels: usize) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            file,
            min_channels,
            retry_delay: FETCH_RETRY_DELAY,
        }
    }

    /// Override the pause between failed fetches.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    async fn fetch_once(&self) -> Result<Vec<ShowEntry>> {
        let text = match &self.file {
            Some(path) => tokio::fs::read_to_string(path)
                .await
                .map_err(|e| Error::io_path("reading schedule", path, e))?,
            None => {
                self.client
                    .get(&self.url)
                    .send()
                    .await?
                    .error_for_status()?
                    .text()
                    .await?
            }
        };
        parse_feed(&text, self.min_channels)
    }
}

#[async_trait]
impl ScheduleSource for HttpScheduleSource {
    async fn fetch_shows(&self) -> Result<Vec<ShowEntry>> {
        let mut attempt = 1;
        loop {
            match self.fetch_once().await {
                Ok(shows) => {
                    debug!(shows = shows.len(), "Fetched schedule");
                    return Ok(shows);
                }
                Err(e) if attempt < FETCH_ATTEMPTS => {
                    warn!(
                        "Failed to load schedule (attempt {}/{}): {}",
                        attempt, FETCH_ATTEMPTS, e
                    );
                    attempt += 1;
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
