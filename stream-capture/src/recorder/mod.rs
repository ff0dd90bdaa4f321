//! Per-job recording: the orchestrator and its output segments.

pub mod orchestrator;
pub mod segments;

pub use orchestrator::{RecorderContext, RecordingOrchestrator};
pub use segments::SegmentSet;
