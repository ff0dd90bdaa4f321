//! The master job set.
//!
//! Holds every job discovered from the schedule until its window has passed.
//! Only the scheduling loop mutates the registry; jobs themselves are shared
//! with their orchestrators through `Arc`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDateTime;
use tracing::{debug, info, warn};

use crate::domain::{ChannelOption, JobDetails, JobKey, JobWindow, RecordingJob, ShowEntry};
use crate::keywords::{KeywordMatcher, KeywordRule};
use crate::utils::filename::capture_file_name;
use crate::{Error, Result};

/// All feed entries of one broadcast, with the rule it matched.
struct Broadcast<'a> {
    show: &'a ShowEntry,
    rule: KeywordRule,
    rank: usize,
    channels: Vec<ChannelOption>,
}

/// Add `show`'s channel unless it is already listed.
fn add_channel(channels: &mut Vec<ChannelOption>, show: &ShowEntry) {
    let channel = ChannelOption::new(&show.channel, &show.quality, &show.language);
    match channels.iter_mut().find(|c| c.number == channel.number) {
        Some(existing) => *existing = channel,
        None => channels.push(channel),
    }
}

/// Channels of every feed entry airing the same broadcast as `show`.
pub fn channels_for(shows: &[ShowEntry], name: &str, raw_start: &str) -> Vec<ChannelOption> {
    let mut channels = Vec::new();
    for show in shows.iter().filter(|s| s.is_same_broadcast(name, raw_start)) {
        add_channel(&mut channels, show);
    }
    channels
}

fn build_details(
    show: &ShowEntry,
    rule: &KeywordRule,
    rank: usize,
    channels: Vec<ChannelOption>,
    offset_hours: i32,
) -> Result<JobDetails> {
    let window = JobWindow::new(
        &show.start,
        &show.end_time,
        show.runtime_minutes,
        rule.pre_minutes,
        rule.post_minutes,
        offset_hours,
    )?;
    Ok(JobDetails {
        id: show.id.clone(),
        description: show.name.clone(),
        category: show.category.clone(),
        window,
        preferences: rule.preferences(),
        rank,
        channels,
        file_name: capture_file_name(&show.name, rule.starred),
    })
}

/// Master set of candidate jobs.
#[derive(Default)]
pub struct JobRegistry {
    jobs: HashMap<JobKey, Arc<RecordingJob>>,
    next_seq: u64,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn get(&self, key: &JobKey) -> Option<Arc<RecordingJob>> {
        self.jobs.get(key).cloned()
    }

    /// All jobs ordered by start time.
    pub fn jobs(&self) -> Vec<Arc<RecordingJob>> {
        let mut jobs: Vec<Arc<RecordingJob>> = self.jobs.values().cloned().collect();
        jobs.sort_by_key(|job| (job.start(), job.discovery_seq()));
        jobs
    }

    /// Jobs carrying the feed id `id`.
    pub fn find_by_id(&self, id: &str) -> Vec<Arc<RecordingJob>> {
        self.jobs
            .values()
            .filter(|job| job.id() == id)
            .cloned()
            .collect()
    }

    fn insert_new(&mut self, details: JobDetails, starred: bool, email: bool) -> Arc<RecordingJob> {
        let job = Arc::new(RecordingJob::new(details, self.next_seq, starred, email));
        self.next_seq += 1;
        self.jobs.insert(job.key().clone(), Arc::clone(&job));
        job
    }

    /// Create or refresh a job for every broadcast that matches a keyword
    /// rule and has not ended. Returns the number of new jobs.
    pub fn apply_schedule(
        &mut self,
        shows: &[ShowEntry],
        matcher: &dyn KeywordMatcher,
        offset_hours: i32,
        now: NaiveDateTime,
    ) -> usize {
        let mut order: Vec<JobKey> = Vec::new();
        let mut broadcasts: HashMap<JobKey, Broadcast<'_>> = HashMap::new();

        for show in shows {
            let key = JobKey::new(&show.start, &show.name);
            if let Some(broadcast) = broadcasts.get_mut(&key) {
                add_channel(&mut broadcast.channels, show);
                continue;
            }
            let Some((rule, rank)) = matcher.find_match(show) else {
                continue;
            };
            let mut channels = Vec::new();
            add_channel(&mut channels, show);
            order.push(key.clone());
            broadcasts.insert(
                key,
                Broadcast {
                    show,
                    rule,
                    rank,
                    channels,
                },
            );
        }

        let mut created = 0;
        for key in order {
            let Some(broadcast) = broadcasts.remove(&key) else {
                continue;
            };
            let details = match build_details(
                broadcast.show,
                &broadcast.rule,
                broadcast.rank,
                broadcast.channels,
                offset_hours,
            ) {
                Ok(details) => details,
                Err(e) => {
                    warn!(show = %broadcast.show.name, "Skipping show with bad times: {}", e);
                    continue;
                }
            };
            if details.window.end() <= now {
                continue;
            }

            let (starred, email) = (broadcast.rule.starred, broadcast.rule.email);
            match self.jobs.get(&key) {
                Some(job) => job.refresh(details, starred, email),
                None => {
                    debug!(show = %details.description, rank = details.rank, "New matching show");
                    self.insert_new(details, starred, email);
                    created += 1;
                }
            }
        }
        created
    }

    /// Drop jobs whose window has passed, unless a capture is still winding
    /// down. Returns the number removed.
    pub fn cleanup(&mut self, now: NaiveDateTime) -> usize {
        let before = self.jobs.len();
        self.jobs
            .retain(|_, job| job.end() >= now || job.phase().is_pinned());
        let removed = before - self.jobs.len();
        if removed > 0 {
            debug!(removed, "Removed finished shows from the job set");
        }
        removed
    }

    /// Queue the show with feed id `id` regardless of capacity.
    ///
    /// A job that is already queued or running is just flagged manual.
    /// Otherwise a fresh job replaces it, built from the registry entry if
    /// there is one, else from the latest feed.
    pub fn queue_manual(
        &mut self,
        id: &str,
        shows: &[ShowEntry],
        matcher: &dyn KeywordMatcher,
        offset_hours: i32,
    ) -> Result<Arc<RecordingJob>> {
        if let Some(existing) = self.find_by_id(id).into_iter().next() {
            let phase = existing.phase();
            if !existing.is_cancelled() && phase.is_queued() && !phase.is_terminal() {
                existing.mark_manual();
                return Ok(existing);
            }
            if phase.is_pinned() {
                return Err(Error::Other(format!(
                    "'{}' is already being captured",
                    existing.description()
                )));
            }

            let mut details = existing.details();
            let latest = channels_for(shows, &details.description, &details.window.raw_start);
            if !latest.is_empty() {
                details.channels = latest;
            }
            let job = self.insert_new(details, existing.is_starred(), existing.wants_email());
            job.mark_manual();
            info!(show = %job.description(), "Show manually queued");
            return Ok(job);
        }

        let show = shows
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| Error::not_found("show", id))?;
        let (rule, rank) = matcher
            .find_match(show)
            .unwrap_or_else(|| (KeywordRule::default(), 0));
        let channels = channels_for(shows, &show.name, &show.start);
        let details = build_details(show, &rule, rank, channels, offset_hours)?;

        let job = self.insert_new(details, rule.starred, rule.email);
        job.mark_manual();
        info!(show = %job.description(), "Show manually queued");
        Ok(job)
    }

    /// Cancel every job with feed id `id`. Returns how many were cancelled.
    pub fn cancel(&self, id: &str) -> usize {
        let jobs = self.find_by_id(id);
        for job in &jobs {
            info!(show = %job.description(), phase = %job.phase(), "Cancelling show");
            job.cancel();
        }
        jobs.len()
    }
}
