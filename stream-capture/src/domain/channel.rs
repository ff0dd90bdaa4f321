//! Channels, preferences and ranked (server, channel) pairs.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Per-job preference strings taken from the matching keyword rule.
///
/// Each string is a comma separated token list; see `SourceRanker` for the
/// scoring rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preferences {
    pub quality: String,
    pub language: String,
    pub channel: String,
}

/// A channel carrying a job's show.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelOption {
    /// Two-digit channel number.
    pub number: String,
    pub quality: String,
    pub language: String,
    /// Preference score computed by the ranker.
    #[serde(default)]
    pub score: i32,
}

impl ChannelOption {
    pub fn new(
        number: impl Into<String>,
        quality: impl Into<String>,
        language: impl Into<String>,
    ) -> Self {
        Self {
            number: normalize_channel_number(&number.into()),
            quality: quality.into(),
            language: language.into(),
            score: 0,
        }
    }
}

impl fmt::Display for ChannelOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}/{})", self.number, self.quality, self.language)
    }
}

/// Channel numbers are always at least two digits wide.
pub fn normalize_channel_number(raw: &str) -> String {
    let raw = raw.trim();
    if raw.len() == 1 {
        format!("0{raw}")
    } else {
        raw.to_string()
    }
}

/// A capture source candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerChannelPair {
    pub server: String,
    pub channel: ChannelOption,
    /// Last known throughput in KB/s.
    pub kbps: i64,
}

impl fmt::Display for ServerChannelPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.server, self.channel.number)
    }
}
