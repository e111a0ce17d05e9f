//! Common types used across fanload

use serde::{Deserialize, Serialize};

use crate::error::{FanloadError, Result};

/// Identifies one source object in object storage.
///
/// Serialises with the wire names used by the dispatch payloads
/// (`bucket` / `key`), so it can be flattened into them directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileReference {
    /// Bucket or container holding the object
    #[serde(rename = "bucket")]
    pub container_id: String,
    /// Object key within the container
    #[serde(rename = "key")]
    pub object_key: String,
}

impl FileReference {
    pub fn new(container_id: impl Into<String>, object_key: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            object_key: object_key.into(),
        }
    }

    /// Build a reference, rejecting empty container or key
    pub fn try_new(container_id: impl Into<String>, object_key: impl Into<String>) -> Result<Self> {
        let file = Self::new(container_id, object_key);
        if file.container_id.trim().is_empty() {
            return Err(FanloadError::InvalidFileReference("container id is empty".to_string()));
        }
        if file.object_key.trim().is_empty() {
            return Err(FanloadError::InvalidFileReference("object key is empty".to_string()));
        }
        Ok(file)
    }

    /// `s3://bucket/key` style URL, used in log lines
    pub fn url(&self) -> String {
        format!("s3://{}/{}", self.container_id, self.object_key)
    }
}

impl std::fmt::Display for FileReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.url())
    }
}

/// Inclusive, 0-indexed range of lines `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LineRange {
    pub start: u64,
    pub end: u64,
}

impl LineRange {
    /// Create a range; fails when `start > end`
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start > end {
            return Err(FanloadError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// Number of lines covered (`end - start + 1`)
    pub fn line_count(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn contains(&self, line: u64) -> bool {
        line >= self.start && line <= self.end
    }
}

impl std::fmt::Display for LineRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}
