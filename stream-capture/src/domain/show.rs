//! Shows as published by the schedule feed.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Formats accepted for feed and operator supplied times.
const FEED_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%m/%d/%y %H:%M",
    "%m/%d/%Y %H:%M",
];

/// Parse a wall-clock time as it appears in the feed.
pub fn parse_feed_time(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    FEED_TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}

/// One airing of a show on one channel.
///
/// The same show is usually listed once per channel carrying it; entries that
/// share `name` and `start` describe the same broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShowEntry {
    pub id: String,
    pub name: String,
    /// Raw start time, unshifted.
    pub start: String,
    /// Raw end time, unshifted.
    pub end_time: String,
    pub runtime_minutes: i64,
    pub category: String,
    pub channel: String,
    pub quality: String,
    pub language: String,
}

impl ShowEntry {
    /// Whether this entry is an airing of the given broadcast.
    pub fn is_same_broadcast(&self, name: &str, raw_start: &str) -> bool {
        self.name == name && self.start == raw_start
    }
}
