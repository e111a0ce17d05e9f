//! Records, payloads, and run outcomes passed between ingestion stages

use chrono::{DateTime, Utc};
use fanload_common::{FileReference, LineRange};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{IngestError, Result};

/// Field order of every source line.
pub const ESTIMATE_FIELDS: [&str; 7] = [
    "udprn",
    "uprn",
    "confidence",
    "confidenceBand",
    "estimateValue",
    "estimateRangeLower",
    "estimateRangeUpper",
];

/// One parsed source line, fields in file order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EstimateRow {
    pub udprn: String,
    pub uprn: String,
    pub confidence: String,
    pub confidence_band: String,
    pub estimate_value: String,
    pub estimate_range_lower: String,
    pub estimate_range_upper: String,
}

impl EstimateRow {
    /// Turn the row into a store record keyed by `(uprn, source_file_key)`
    pub fn into_record(self, source_file_key: &str, created_at: DateTime<Utc>) -> EstimateRecord {
        EstimateRecord {
            uprn: self.uprn,
            source_file_key: source_file_key.to_string(),
            created_at,
            confidence: self.confidence,
            confidence_band: self.confidence_band,
            estimate_value: self.estimate_value,
            estimate_range_lower: self.estimate_range_lower,
            estimate_range_upper: self.estimate_range_upper,
        }
    }
}

/// Destination record; `(uprn, source_file_key)` is the key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EstimateRecord {
    pub uprn: String,
    pub source_file_key: String,
    pub created_at: DateTime<Utc>,
    pub confidence: String,
    pub confidence_band: String,
    pub estimate_value: String,
    pub estimate_range_lower: String,
    pub estimate_range_upper: String,
}

impl EstimateRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            uprn: self.uprn.clone(),
            source_file_key: self.source_file_key.clone(),
        }
    }
}

/// Composite destination key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub uprn: String,
    pub source_file_key: String,
}

impl RecordKey {
    pub fn new(uprn: impl Into<String>, source_file_key: impl Into<String>) -> Self {
        Self {
            uprn: uprn.into(),
            source_file_key: source_file_key.into(),
        }
    }
}

/// Input of a run: `{bucket, key}`
pub type RunInput = FileReference;

/// One planned range as handed to the dispatch mechanism: `{bucket, key, start, end}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchItem {
    #[serde(flatten)]
    pub file: FileReference,
    #[serde(flatten)]
    pub range: LineRange,
}

impl DispatchItem {
    pub fn new(file: FileReference, range: LineRange) -> Self {
        Self { file, range }
    }

    /// Re-check `start <= end` after deserialising from an external payload
    pub fn validated(self) -> Result<Self> {
        LineRange::new(self.range.start, self.range.end)?;
        Ok(self)
    }
}

/// Opaque correlation token for one dispatched task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompletionToken(Uuid);

impl CompletionToken {
    pub(crate) fn mint() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for CompletionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for CompletionToken {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| IngestError::ProtocolViolation(format!("unrecognised token {s:?}: {e}")))
    }
}

/// Worker invocation payload: `{payload: {bucket, key, start, end}, token}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInvocation {
    pub payload: DispatchItem,
    pub token: CompletionToken,
}

/// What a worker reports for its batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// Batch processed; `records` may be below the range size on a short read
    Succeeded { records: u64 },
    Failed { reason: String },
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Succeeded { .. })
    }
}

/// Terminal status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    TimedOut,
}

impl RunStatus {
    pub fn as_str(&self) -> &str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::TimedOut => "timed_out",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-batch line in a run's manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    pub token: CompletionToken,
    pub range: LineRange,
    /// `None` while the task never signalled (only possible on timeout)
    pub outcome: Option<TaskOutcome>,
}

/// Terminal result of one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub file: FileReference,
    pub status: RunStatus,
    pub total_lines: Option<u64>,
    pub batches: usize,
    pub manifest: Vec<TaskReport>,
    /// Duplicate or unknown completion signals seen while waiting
    pub protocol_violations: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> usize {
        self.manifest
            .iter()
            .filter(|r| matches!(r.outcome, Some(TaskOutcome::Succeeded { .. })))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.manifest
            .iter()
            .filter(|r| matches!(r.outcome, Some(TaskOutcome::Failed { .. })))
            .count()
    }

    pub fn outstanding(&self) -> usize {
        self.manifest.iter().filter(|r| r.outcome.is_none()).count()
    }

    pub fn records_written(&self) -> u64 {
        self.manifest
            .iter()
            .filter_map(|r| match r.outcome {
                Some(TaskOutcome::Succeeded { records }) => Some(records),
                _ => None,
            })
            .sum()
    }

    /// Collapse to pass/fail for callers that only need the run verdict
    pub fn into_result(self) -> Result<RunOutcome> {
        match self.status {
            RunStatus::Completed => Ok(self),
            RunStatus::Failed => Err(IngestError::RunFailed {
                failed: self.failed(),
                total: self.batches,
            }),
            RunStatus::TimedOut => Err(IngestError::TimedOut {
                elapsed: (self.finished_at - self.started_at).to_std().unwrap_or_default(),
                outstanding: self.outstanding(),
            }),
        }
    }
}
