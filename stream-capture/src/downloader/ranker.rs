//! Source ranking and failover for a single recording.
//!
//! Candidates are ordered channel first (by preference score), then by the
//! historical throughput of each server on that channel. The ranker keeps a
//! cursor into that list; once every candidate has been tried it latches onto
//! the best performer for the rest of the capture.

use tracing::{debug, info};

use crate::domain::{ChannelOption, Preferences, ServerChannelPair};
use crate::history::ChannelHistoryStore;

/// Score of one attribute against a comma separated preference list.
///
/// Each token may carry `+` (boost) or `-` (penalty) markers. A token that
/// appears case-insensitively in `attribute` contributes the marker balance,
/// plus one unless the balance is negative.
pub fn preference_score(attribute: &str, preference: &str) -> i32 {
    if attribute.is_empty() || preference.is_empty() {
        return 0;
    }
    let attribute = attribute.to_lowercase();

    preference
        .split(',')
        .filter_map(|token| {
            let balance: i32 = token
                .chars()
                .map(|c| match c {
                    '+' => 1,
                    '-' => -1,
                    _ => 0,
                })
                .sum();
            let needle: String = token
                .chars()
                .filter(|c| *c != '+' && *c != '-')
                .collect::<String>()
                .trim()
                .to_lowercase();

            (!needle.is_empty() && attribute.contains(&needle))
                .then_some(if balance >= 0 { balance + 1 } else { balance })
        })
        .sum()
}

/// Total preference score of a channel across quality, language and number.
pub fn channel_score(channel: &ChannelOption, preferences: &Preferences) -> i32 {
    preference_score(&channel.quality, &preferences.quality)
        + preference_score(&channel.language, &preferences.language)
        + preference_score(&channel.number, &preferences.channel)
}

/// Ordered (server, channel) candidates with a failover cursor.
#[derive(Debug, Clone)]
pub struct SourceRanker {
    pairs: Vec<ServerChannelPair>,
    cursor: usize,
    best_selected: bool,
}

impl SourceRanker {
    /// Rank `channels` against `preferences`, trying `servers` in list order
    /// unless history says otherwise. With no servers configured a single
    /// unnamed server is assumed.
    pub fn new(
        channels: &[ChannelOption],
        preferences: &Preferences,
        servers: &[String],
        history: &ChannelHistoryStore,
    ) -> Self {
        let mut scored: Vec<ChannelOption> = channels
            .iter()
            .cloned()
            .map(|mut channel| {
                channel.score = channel_score(&channel, preferences);
                channel
            })
            .collect();
        // stable: equal scores keep feed order
        scored.sort_by(|a, b| b.score.cmp(&a.score));

        let fallback = [String::new()];
        let servers = if servers.is_empty() { &fallback[..] } else { servers };

        let pairs: Vec<ServerChannelPair> = scored
            .into_iter()
            .flat_map(|channel| {
                let mut per_channel: Vec<ServerChannelPair> = servers
                    .iter()
                    .map(|server| ServerChannelPair {
                        server: server.clone(),
                        kbps: history.throughput(server, &channel.number),
                        channel: channel.clone(),
                    })
                    .collect();
                per_channel.sort_by(|a, b| b.kbps.cmp(&a.kbps));
                per_channel
            })
            .collect();

        for pair in &pairs {
            debug!(
                server = %pair.server,
                channel = %pair.channel,
                score = pair.channel.score,
                kbps = pair.kbps,
                "Ranked candidate"
            );
        }

        Self {
            pairs,
            cursor: 0,
            best_selected: false,
        }
    }

    pub fn pairs(&self) -> &[ServerChannelPair] {
        &self.pairs
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// The candidate at the cursor, `None` only when there are no channels.
    pub fn current(&self) -> Option<&ServerChannelPair> {
        self.pairs.get(self.cursor)
    }

    /// Overwrite the in-memory rate of the current candidate.
    pub fn record_observed_throughput(&mut self, kbps: i64) {
        if let Some(pair) = self.pairs.get_mut(self.cursor) {
            pair.kbps = kbps;
        }
    }

    pub fn is_best_selected(&self) -> bool {
        self.best_selected
    }

    /// Move to the next candidate.
    ///
    /// After the last candidate, selects the one with the highest observed
    /// rate and stays on it from then on.
    pub fn advance(&mut self) -> Option<&ServerChannelPair> {
        if self.best_selected || self.pairs.is_empty() {
            return self.current();
        }

        self.cursor += 1;
        if let Some(pair) = self.pairs.get(self.cursor) {
            info!(
                server = %pair.server,
                channel = %pair.channel.number,
                kbps = pair.kbps,
                "Switching server/channel pair"
            );
            return self.pairs.get(self.cursor);
        }

        let mut best_kbps = 0;
        for (idx, pair) in self.pairs.iter().enumerate() {
            if pair.kbps >= best_kbps {
                best_kbps = pair.kbps;
                self.cursor = idx;
            }
        }
        if self.cursor >= self.pairs.len() {
            // every rate negative
            self.cursor = 0;
        }
        self.best_selected = true;

        let pair = &self.pairs[self.cursor];
        info!(
            server = %pair.server,
            channel = %pair.channel.number,
            kbps = pair.kbps,
            "Using best server/channel pair for the rest of the capture"
        );
        self.current()
    }
}
