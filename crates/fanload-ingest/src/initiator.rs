//! Trigger initiator: one run per arrived file
//!
//! Arrival notifications use the object-created event shape:
//!
//! ```json
//! {"Records": [{"s3": {"bucket": {"name": "landing"}, "object": {"key": "estimates+2024.csv"}}}]}
//! ```
//!
//! Object keys arrive URL-encoded (`+` for space) and are decoded before a run
//! starts. Duplicate notifications start duplicate runs; the destination's
//! upsert semantics make that safe.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use fanload_common::FileReference;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::coordinator::FanoutCoordinator;
use crate::error::{IngestError, Result};
use crate::types::{RunInput, RunOutcome};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrivalEvent {
    #[serde(rename = "Records", default)]
    pub records: Vec<ArrivalRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrivalRecord {
    pub s3: ObjectEntity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEntity {
    pub bucket: BucketRef,
    pub object: ObjectRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketRef {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub key: String,
}

impl ArrivalEvent {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| IngestError::InvalidEvent(e.to_string()))
    }

    /// Event announcing `files`, keys encoded the way notifications encode them
    pub fn for_files<'a>(files: impl IntoIterator<Item = &'a FileReference>) -> Self {
        Self {
            records: files
                .into_iter()
                .map(|file| ArrivalRecord {
                    s3: ObjectEntity {
                        bucket: BucketRef {
                            name: file.container_id.clone(),
                        },
                        object: ObjectRef {
                            key: urlencoding::encode(&file.object_key).replace("%20", "+"),
                        },
                    },
                })
                .collect(),
        }
    }

    /// Decoded file references, in event order
    pub fn file_references(&self) -> Result<Vec<FileReference>> {
        self.records
            .iter()
            .map(|record| {
                let raw_key = record.s3.object.key.replace('+', " ");
                let key = urlencoding::decode(&raw_key)
                    .map_err(|e| IngestError::InvalidEvent(format!("object key {raw_key:?}: {e}")))?;
                FileReference::try_new(record.s3.bucket.name.clone(), key.into_owned())
                    .map_err(|e| IngestError::InvalidEvent(e.to_string()))
            })
            .collect()
    }
}

/// Opaque reference to a started run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionRef(Uuid);

impl ExecutionRef {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionRef {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Starts runs; the orchestration behind it is up to the implementation
#[async_trait]
pub trait RunLauncher: Send + Sync {
    async fn start(&self, input: RunInput) -> Result<ExecutionRef>;
}

/// Launches each run as a tokio task in this process
///
/// Every started run is held until it is collected with [`wait`](Self::wait),
/// [`wait_all`](Self::wait_all) or [`reap_finished`](Self::reap_finished).
/// Long-lived callers that never wait must reap, or the run table keeps
/// growing.
pub struct InProcessLauncher {
    coordinator: Arc<FanoutCoordinator>,
    runs: Mutex<HashMap<ExecutionRef, JoinHandle<Result<RunOutcome>>>>,
}

impl InProcessLauncher {
    pub fn new(coordinator: Arc<FanoutCoordinator>) -> Self {
        Self {
            coordinator,
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub async fn running(&self) -> usize {
        self.runs.lock().await.len()
    }

    /// Wait for one run's terminal outcome
    pub async fn wait(&self, execution: ExecutionRef) -> Result<RunOutcome> {
        let handle = self
            .runs
            .lock()
            .await
            .remove(&execution)
            .ok_or_else(|| IngestError::RunAborted(format!("unknown execution {execution}")))?;

        handle
            .await
            .map_err(|e| IngestError::RunAborted(format!("execution {execution}: {e}")))?
    }

    /// Wait for every run started so far
    pub async fn wait_all(&self) -> Vec<(ExecutionRef, Result<RunOutcome>)> {
        let runs: Vec<_> = self.runs.lock().await.drain().collect();
        collect_runs(runs).await
    }

    /// Collect the runs that have already finished without waiting on the rest
    pub async fn reap_finished(&self) -> Vec<(ExecutionRef, Result<RunOutcome>)> {
        let finished: Vec<_> = {
            let mut runs = self.runs.lock().await;
            let done: Vec<ExecutionRef> = runs
                .iter()
                .filter(|(_, handle)| handle.is_finished())
                .map(|(execution, _)| *execution)
                .collect();
            done.into_iter()
                .filter_map(|execution| runs.remove(&execution).map(|handle| (execution, handle)))
                .collect()
        };

        if !finished.is_empty() {
            debug!("Reaped {} finished run(s)", finished.len());
        }
        collect_runs(finished).await
    }
}

async fn collect_runs(
    runs: Vec<(ExecutionRef, JoinHandle<Result<RunOutcome>>)>,
) -> Vec<(ExecutionRef, Result<RunOutcome>)> {
    let mut results = Vec::with_capacity(runs.len());
    for (execution, handle) in runs {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(IngestError::RunAborted(format!("execution {execution}: {e}"))),
        };
        results.push((execution, result));
    }
    results
}

#[async_trait]
impl RunLauncher for InProcessLauncher {
    async fn start(&self, input: RunInput) -> Result<ExecutionRef> {
        let execution = ExecutionRef::new();
        let coordinator = Arc::clone(&self.coordinator);
        let handle = tokio::spawn(async move { coordinator.run(&input).await });

        self.runs.lock().await.insert(execution, handle);
        Ok(execution)
    }
}

pub struct TriggerInitiator<L> {
    launcher: L,
}

impl<L: RunLauncher> TriggerInitiator<L> {
    pub fn new(launcher: L) -> Self {
        Self { launcher }
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Start one run per file in `event`
    #[instrument(skip_all, fields(records = event.records.len()))]
    pub async fn on_arrival(&self, event: &ArrivalEvent) -> Result<Vec<ExecutionRef>> {
        info!("Received arrival event with {} record(s)", event.records.len());

        let files = event.file_references()?;
        let mut started = Vec::with_capacity(files.len());
        for file in files {
            let url = file.url();
            let execution = self.launcher.start(file).await?;
            info!(execution = %execution, "Started run for {}", url);
            started.push(execution);
        }

        Ok(started)
    }
}
