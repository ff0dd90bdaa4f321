//! Small shared helpers.

pub mod clock;
pub mod filename;
pub mod fs;

pub use clock::{Clock, ManualClock, SystemClock};
