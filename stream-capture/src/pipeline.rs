//! Hand-off of finished captures to post-processing.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::info;

use crate::Result;

/// What post-processing needs to know about a capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureMetadata {
    pub description: String,
    pub category: String,
    /// Offset of the show start into the first segment.
    pub offset_seconds: i64,
}

/// Concatenates, muxes and publishes capture segments.
#[async_trait]
pub trait VideoPipeline: Send + Sync {
    /// `segments` are in capture order.
    async fn process(&self, segments: Vec<PathBuf>, metadata: CaptureMetadata) -> Result<()>;
}

/// Leaves segments where they were written.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughPipeline;

#[async_trait]
impl VideoPipeline for PassthroughPipeline {
    async fn process(&self, segments: Vec<PathBuf>, metadata: CaptureMetadata) -> Result<()> {
        info!(
            show = %metadata.description,
            category = %metadata.category,
            segments = segments.len(),
            "Capture segments left in place"
        );
        Ok(())
    }
}
