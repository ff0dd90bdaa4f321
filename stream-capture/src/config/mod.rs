//! Recorder configuration.
//!
//! Settings are read once at startup from a JSON file (`appsettings.json` by
//! default) and shared read-only through an `Arc`. Credentials and tool paths
//! may be overridden from the environment (a `.env` file is honoured).

mod settings;

pub use settings::{FutureWindow, RecorderConfig};
