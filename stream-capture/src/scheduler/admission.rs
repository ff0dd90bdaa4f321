//! Admission control.
//!
//! Jobs are offered slots in priority order. Each candidate is checked
//! against the jobs already admitted with an interval sweep; a candidate that
//! would push the number of overlapping captures past its cap is rejected and
//! re-evaluated on the next pass. The packing is greedy, not optimal.

use std::sync::Arc;

use chrono::NaiveDateTime;
use tracing::{debug, info};

use crate::domain::{JobPhase, RecordingJob};

/// Inputs of one admission pass.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionParams {
    pub now: NaiveDateTime,
    /// Jobs starting at or after this are not considered yet.
    pub future_cutoff: NaiveDateTime,
    pub concurrency_cap: usize,
    /// Extra slots open to starred jobs.
    pub starred_bonus: usize,
    /// Newly queued jobs longer than this are reported.
    pub long_show_minutes: i64,
}

/// A job's interval as seen by the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

/// Result of an admission pass.
#[derive(Default)]
pub struct AdmissionOutcome {
    /// Admitted jobs in start order.
    pub admitted: Vec<Arc<RecordingJob>>,
    pub newly_queued: Vec<Arc<RecordingJob>>,
    pub newly_too_many: Vec<Arc<RecordingJob>>,
    /// Newly queued jobs over the long-show threshold.
    pub long_shows: Vec<Arc<RecordingJob>>,
    /// Waiting jobs whose slot went to a higher priority job.
    pub revoked: Vec<Arc<RecordingJob>>,
}

/// Whether `candidate` fits next to the already `accepted` slots (sorted by
/// start) without exceeding `cap` concurrent captures.
pub fn fits(candidate: Slot, accepted: &[Slot], cap: usize) -> bool {
    let mut merged: Vec<Slot> = accepted
        .iter()
        .copied()
        .filter(|slot| slot.start < candidate.end)
        .collect();
    let pos = merged
        .iter()
        .position(|slot| candidate.start < slot.start)
        .unwrap_or(merged.len());
    merged.insert(pos, candidate);

    let mut active_ends: Vec<NaiveDateTime> = Vec::new();
    let mut concurrent = 0usize;
    for slot in &merged {
        concurrent += 1;
        let before = active_ends.len();
        active_ends.retain(|end| slot.start < *end);
        concurrent -= before - active_ends.len();
        active_ends.push(slot.end);

        if concurrent > cap {
            return false;
        }
    }
    true
}

fn insert_by_start(slots: &mut Vec<Slot>, slot: Slot) -> usize {
    let pos = slots
        .iter()
        .position(|s| slot.start < s.start)
        .unwrap_or(slots.len());
    slots.insert(pos, slot);
    pos
}

/// Stateless admission scheduler.
#[derive(Debug, Default, Clone, Copy)]
pub struct AdmissionScheduler;

impl AdmissionScheduler {
    /// Decide which of `jobs` hold a recording slot and update their phases.
    ///
    /// Jobs whose capture has begun keep their slot and are placed first.
    /// Manual jobs are admitted without a capacity check.
    pub fn compute_queue(jobs: &[Arc<RecordingJob>], params: &AdmissionParams) -> AdmissionOutcome {
        let mut candidates: Vec<&Arc<RecordingJob>> = jobs
            .iter()
            .filter(|job| {
                let phase = job.phase();
                !phase.is_terminal()
                    && !job.is_cancelled()
                    && job.start() < params.future_cutoff
                    && job.end() > params.now
            })
            .collect();
        candidates.sort_by_key(|job| (!job.phase().is_pinned(), job.rank(), job.discovery_seq()));

        let mut accepted: Vec<Slot> = Vec::new();
        let mut admitted: Vec<Arc<RecordingJob>> = Vec::new();
        let mut outcome = AdmissionOutcome::default();

        for job in candidates {
            let slot = Slot {
                start: job.start(),
                end: job.end(),
            };
            let phase = job.phase();
            let cap = if job.is_starred() {
                params.concurrency_cap + params.starred_bonus
            } else {
                params.concurrency_cap
            };

            if phase.is_pinned() || job.is_manual() || fits(slot, &accepted, cap) {
                let pos = insert_by_start(&mut accepted, slot);
                admitted.insert(pos, Arc::clone(job));
                Self::admit(job, phase, params, &mut outcome);
            } else {
                Self::reject(job, phase, &mut outcome);
            }
        }

        outcome.admitted = admitted;
        outcome
    }

    fn admit(
        job: &Arc<RecordingJob>,
        phase: JobPhase,
        params: &AdmissionParams,
        outcome: &mut AdmissionOutcome,
    ) {
        if !matches!(phase, JobPhase::Selected | JobPhase::TooMany) {
            return;
        }
        if job.transition_if(phase, JobPhase::Queued) {
            info!(
                job = %job.description(),
                start = %job.start(),
                end = %job.end(),
                "Show newly queued"
            );
            // whole-window minutes, so 4h00m30s is not long but 4h01m is
            let minutes = (job.end() - job.start()).num_minutes();
            if minutes > params.long_show_minutes {
                outcome.long_shows.push(Arc::clone(job));
            }
            outcome.newly_queued.push(Arc::clone(job));
        }
    }

    fn reject(job: &Arc<RecordingJob>, phase: JobPhase, outcome: &mut AdmissionOutcome) {
        match phase {
            JobPhase::Selected | JobPhase::Queued | JobPhase::Waiting => {
                if job.transition_if(phase, JobPhase::TooMany) {
                    info!(
                        job = %job.description(),
                        start = %job.start(),
                        end = %job.end(),
                        "Too many at once"
                    );
                    if phase == JobPhase::Waiting {
                        job.wake();
                        outcome.revoked.push(Arc::clone(job));
                    }
                    outcome.newly_too_many.push(Arc::clone(job));
                }
            }
            _ => debug!(job = %job.description(), %phase, "Still too many at once"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::job::tests::details;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn slot(start: (u32, u32), end: (u32, u32)) -> Slot {
        Slot {
            start: at(start.0, start.1),
            end: at(end.0, end.1),
        }
    }

    fn job(name: &str, start: &str, end: &str, rank: usize, seq: u64) -> Arc<RecordingJob> {
        Arc::new(RecordingJob::new(details(name, start, end, rank), seq, false, false))
    }

    fn params(cap: usize) -> AdmissionParams {
        AdmissionParams {
            now: at(8, 0),
            future_cutoff: at(23, 0),
            concurrency_cap: cap,
            starred_bonus: 1,
            long_show_minutes: 240,
        }
    }

    #[test]
    fn test_fits_sweep() {
        let accepted = vec![slot((10, 0), (11, 0))];
        assert!(!fits(slot((10, 30), (11, 30)), &accepted, 1));
        assert!(fits(slot((10, 30), (11, 30)), &accepted, 2));
        // back to back shares the slot
        assert!(fits(slot((11, 0), (12, 0)), &accepted, 1));
        assert!(fits(slot((9, 0), (10, 0)), &accepted, 1));
    }

    #[test]
    fn test_sweep_frees_every_ended_slot() {
        let accepted = vec![slot((9, 0), (9, 30)), slot((9, 10), (9, 40)), slot((10, 0), (12, 0))];
        assert!(fits(slot((10, 30), (11, 0)), &accepted, 2));
        assert!(!fits(slot((10, 30), (11, 0)), &accepted, 1));
    }

    #[test]
    fn test_higher_priority_bumps_admitted_job() {
        let low = job("Low", "2024-03-09 10:00:00", "2024-03-09 11:00:00", 3, 0);
        let outcome = AdmissionScheduler::compute_queue(&[Arc::clone(&low)], &params(1));
        assert_eq!(outcome.newly_queued.len(), 1);
        low.mark_spawned().unwrap();

        let high = job("High", "2024-03-09 10:30:00", "2024-03-09 11:30:00", 0, 1);
        let jobs = vec![Arc::clone(&low), Arc::clone(&high)];
        let outcome = AdmissionScheduler::compute_queue(&jobs, &params(1));

        assert_eq!(high.phase(), JobPhase::Queued);
        assert_eq!(low.phase(), JobPhase::TooMany);
        assert_eq!(outcome.revoked.len(), 1);
        assert_eq!(outcome.newly_too_many.len(), 1);

        // a second pass reports nothing new
        let outcome = AdmissionScheduler::compute_queue(&jobs, &params(1));
        assert!(outcome.newly_queued.is_empty());
        assert!(outcome.newly_too_many.is_empty());
    }

    #[test]
    fn test_started_capture_keeps_its_slot() {
        let low = job("Low", "2024-03-09 10:00:00", "2024-03-09 11:00:00", 3, 0);
        AdmissionScheduler::compute_queue(&[Arc::clone(&low)], &params(1));
        let epoch = low.mark_spawned().unwrap();
        assert!(low.begin_capture(epoch));

        let high = job("High", "2024-03-09 10:30:00", "2024-03-09 11:30:00", 0, 1);
        let jobs = vec![Arc::clone(&high), Arc::clone(&low)];
        let outcome = AdmissionScheduler::compute_queue(&jobs, &params(1));

        assert_eq!(low.phase(), JobPhase::Authenticating);
        assert_eq!(high.phase(), JobPhase::TooMany);
        assert_eq!(outcome.admitted.len(), 1);
    }

    #[test]
    fn test_starred_and_manual_caps() {
        let first = job("First", "2024-03-09 10:00:00", "2024-03-09 11:00:00", 0, 0);
        let starred = Arc::new(RecordingJob::new(
            details("Starred", "2024-03-09 10:00:00", "2024-03-09 11:00:00", 1),
            1,
            true,
            false,
        ));
        let plain = job("Plain", "2024-03-09 10:00:00", "2024-03-09 11:00:00", 2, 2);
        let manual = job("Manual", "2024-03-09 10:00:00", "2024-03-09 11:00:00", 3, 3);
        manual.mark_manual();

        let jobs = vec![first, Arc::clone(&starred), Arc::clone(&plain), Arc::clone(&manual)];
        let outcome = AdmissionScheduler::compute_queue(&jobs, &params(1));

        assert_eq!(starred.phase(), JobPhase::Queued);
        assert_eq!(plain.phase(), JobPhase::TooMany);
        assert_eq!(manual.phase(), JobPhase::Queued);
        assert_eq!(outcome.admitted.len(), 3);
    }

    #[test]
    fn test_window_filters() {
        let past = job("Past", "2024-03-09 06:00:00", "2024-03-09 07:00:00", 0, 0);
        let far = job("Far", "2024-03-09 23:30:00", "2024-03-10 01:00:00", 0, 1);
        let cancelled = job("Cancelled", "2024-03-09 10:00:00", "2024-03-09 11:00:00", 0, 2);
        cancelled.cancel();
        let long = job("Long", "2024-03-09 12:00:00", "2024-03-09 17:00:00", 0, 3);

        let jobs = vec![Arc::clone(&past), Arc::clone(&far), cancelled, Arc::clone(&long)];
        let outcome = AdmissionScheduler::compute_queue(&jobs, &params(2));

        assert_eq!(past.phase(), JobPhase::Selected);
        assert_eq!(far.phase(), JobPhase::Selected);
        assert_eq!(outcome.admitted.len(), 1);
        assert_eq!(outcome.long_shows.len(), 1);
    }
}
