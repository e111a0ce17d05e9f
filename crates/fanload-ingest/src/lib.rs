//! fanload Ingest Library
//!
//! Parallel batch ingestion of large delimited files from object storage into
//! a keyed store.
//!
//! # Pipeline
//!
//! - **[`counter`]**: streams a file once and counts its lines
//! - **[`planner`]**: splits `[0, total)` into inclusive batch ranges
//! - **[`reader`]**: skips to a range's start and parses its rows
//! - **[`worker`]**: upserts one range and signals its completion handle
//! - **[`coordinator`]**: fans batches out and waits for every signal
//! - **[`initiator`]**: starts one run per file in an arrival event
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use fanload_common::FileReference;
//! use fanload_ingest::{FanoutCoordinator, IngestConfig, LocalSource, MemoryStore, RunStatus};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let coordinator = FanoutCoordinator::with_worker_pool(
//!         Arc::new(LocalSource::new("./data")),
//!         Arc::new(MemoryStore::new()),
//!         IngestConfig::default(),
//!     )?;
//!
//!     let outcome = coordinator.run(&FileReference::new("landing", "estimates.csv")).await?;
//!     assert_eq!(outcome.status, RunStatus::Completed);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod counter;
pub mod error;
pub mod initiator;
pub mod planner;
pub mod reader;
pub mod source;
pub mod store;
pub mod task;
pub mod types;
pub mod worker;

pub use config::{DatabaseConfig, IngestConfig};
pub use coordinator::{Dispatcher, FanoutCoordinator, RunState, RunTracker, WorkerPool};
pub use counter::LineCounter;
pub use error::{IngestError, Result};
pub use initiator::{ArrivalEvent, ExecutionRef, InProcessLauncher, RunLauncher, TriggerInitiator};
pub use planner::{plan, BatchPlanner, FilePlan};
pub use reader::RangeReader;
pub use source::{LocalSource, MemorySource, ObjectSource, S3Source, StorageConfig};
pub use store::{EstimateStore, MemoryStore, PostgresStore};
pub use task::{BatchTask, CompletionHandle, CompletionSender};
pub use types::{
    CompletionToken, DispatchItem, EstimateRecord, EstimateRow, RecordKey, RunInput, RunOutcome, RunStatus,
    TaskOutcome, TaskReport, WorkerInvocation,
};
pub use worker::BatchWorker;
