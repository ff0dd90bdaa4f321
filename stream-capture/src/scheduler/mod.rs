//! Job discovery, admission control and the scheduling loop.

pub mod admission;
pub mod registry;
pub mod service;

pub use admission::{AdmissionOutcome, AdmissionParams, AdmissionScheduler, Slot};
pub use registry::{JobRegistry, channels_for};
pub use service::{ControlCommand, ControlHandle, ScheduleService, next_check_time};
