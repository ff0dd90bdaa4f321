//! Domain types shared by the scheduler, ranker and orchestrator.

pub mod channel;
pub mod job;
pub mod show;

pub use channel::{ChannelOption, Preferences, ServerChannelPair};
pub use job::{JobDetails, JobKey, JobPhase, JobSnapshot, JobWindow, RecordingJob};
pub use show::{ShowEntry, parse_feed_time};
