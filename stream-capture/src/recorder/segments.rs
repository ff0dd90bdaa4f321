//! Output segment bookkeeping for one job.

use std::path::{Path, PathBuf};

use tracing::{info, warn};
use uuid::Uuid;

use crate::Result;
use crate::utils::fs::{ensure_dir_all, io_error};

/// Extension of raw capture segments.
pub const SEGMENT_EXTENSION: &str = "ts";

/// The ordered capture segments of one job: `<base>.ts`, `<base>1.ts`, ...
#[derive(Debug, Clone)]
pub struct SegmentSet {
    dir: PathBuf,
    base: String,
    segments: Vec<PathBuf>,
}

impl SegmentSet {
    pub fn new(dir: impl Into<PathBuf>, base: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            base: base.into(),
            segments: Vec::new(),
        }
    }

    fn segment_path(&self, index: usize) -> PathBuf {
        let name = if index == 0 {
            format!("{}.{SEGMENT_EXTENSION}", self.base)
        } else {
            format!("{}{index}.{SEGMENT_EXTENSION}", self.base)
        };
        self.dir.join(name)
    }

    /// Reserve the path of the next segment.
    ///
    /// A leftover file at that path, e.g. from an earlier run, is renamed
    /// out of the way first.
    pub async fn next_segment(&mut self) -> Result<PathBuf> {
        ensure_dir_all(&self.dir).await?;
        let path = self.segment_path(self.segments.len());

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let aside = self.aside_path(&path);
            warn!(
                from = %path.display(),
                to = %aside.display(),
                "Segment file already exists, moving it aside"
            );
            tokio::fs::rename(&path, &aside)
                .await
                .map_err(|e| io_error("moving aside", &path, e))?;
        }

        self.segments.push(path.clone());
        Ok(path)
    }

    fn aside_path(&self, path: &Path) -> PathBuf {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.base.clone());
        let suffix = Uuid::new_v4().simple().to_string();
        self.dir
            .join(format!("{stem}_{}.{SEGMENT_EXTENSION}", &suffix[..8]))
    }

    /// Every reserved segment path, in capture order.
    pub fn segments(&self) -> &[PathBuf] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Segments that were actually written, in capture order.
    pub async fn written(&self) -> Vec<PathBuf> {
        let mut written = Vec::with_capacity(self.segments.len());
        for path in &self.segments {
            if tokio::fs::try_exists(path).await.unwrap_or(false) {
                written.push(path.clone());
            }
        }
        info!(
            reserved = self.segments.len(),
            written = written.len(),
            "Collected capture segments"
        );
        written
    }
}
