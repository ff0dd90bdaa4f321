//! stream-capture library crate.
//!
//! Records scheduled live-stream broadcasts: discovers shows from a schedule
//! feed, admits them under a concurrency budget, and supervises an external
//! capture tool for each one with source failover.

pub mod auth;
pub mod config;
pub mod connectivity;
pub mod domain;
pub mod downloader;
pub mod error;
pub mod history;
pub mod keywords;
pub mod logging;
pub mod notification;
pub mod pipeline;
pub mod recorder;
pub mod retention;
pub mod schedule;
pub mod scheduler;
pub mod utils;

pub use error::{Error, Result};
