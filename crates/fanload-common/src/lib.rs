//! fanload Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, logging, and error handling for the fanload workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`FanloadError`] and the [`Result`] alias
//! - **Logging**: tracing subscriber setup driven by [`logging::LogConfig`]
//! - **Types**: [`FileReference`] and [`LineRange`], the identifiers every
//!   stage of a run passes around
//!
//! # Example
//!
//! ```
//! use fanload_common::{FileReference, LineRange};
//!
//! let file = FileReference::new("landing-bucket", "estimates/2024-01.csv");
//! let range = LineRange::new(0, 49_999).unwrap();
//! assert_eq!(range.line_count(), 50_000);
//! assert_eq!(file.url(), "s3://landing-bucket/estimates/2024-01.csv");
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{FanloadError, Result};
pub use types::{FileReference, LineRange};
