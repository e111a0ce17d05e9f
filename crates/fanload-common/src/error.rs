//! Error types shared across fanload crates

use thiserror::Error;

/// Result type alias for fanload operations
pub type Result<T> = std::result::Result<T, FanloadError>;

/// Errors raised by the shared types and helpers
#[derive(Error, Debug)]
pub enum FanloadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid line range: start {start} is after end {end}")]
    InvalidRange { start: u64, end: u64 },

    #[error("Invalid file reference: {0}")]
    InvalidFileReference(String),
}
