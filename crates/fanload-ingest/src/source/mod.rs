//! Forward-only access to source objects
//!
//! Sources hand out one sequential byte stream per `open`. Nothing here
//! supports seeking; readers that need line `n` skip the `n` lines before it.

use std::pin::Pin;

use async_trait::async_trait;
use fanload_common::FileReference;
use tokio::io::AsyncBufRead;

use crate::error::Result;

pub mod config;
pub mod local;
pub mod memory;
pub mod s3;

pub use config::StorageConfig;
pub use local::LocalSource;
pub use memory::MemorySource;
pub use s3::S3Source;

/// Buffered sequential stream over one object
pub type LineStream = Pin<Box<dyn AsyncBufRead + Send>>;

/// Read buffer for file-backed streams
pub(crate) const STREAM_BUFFER_BYTES: usize = 256 * 1024;

#[async_trait]
pub trait ObjectSource: Send + Sync {
    /// Open a fresh stream positioned at the first byte of the object.
    ///
    /// Fails with `SourceUnreadable` when the object is missing or access
    /// is denied.
    async fn open(&self, file: &FileReference) -> Result<LineStream>;

    /// Short name used in logs
    fn kind(&self) -> &'static str;
}
