//! Capture source selection and process supervision.

pub mod command;
pub mod ranker;
pub mod supervisor;

pub use command::{CommandValues, build_capture_args};
pub use ranker::SourceRanker;
pub use supervisor::{
    CaptureRequest, CaptureResult, CaptureRunner, CaptureSupervisor, HealthCheck, HealthVerdict,
    StopReason,
};
