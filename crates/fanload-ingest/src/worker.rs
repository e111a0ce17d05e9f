//! Batch worker
//!
//! Reads one line range, upserts the parsed records, and presents the task's
//! completion handle exactly once: success with the record count, or failure
//! with the error. Errors never escape `process`.

use std::sync::Arc;

use chrono::Utc;
use fanload_common::{FileReference, LineRange};
use tracing::{error, info, instrument, warn};

use crate::config::IngestConfig;
use crate::error::Result;
use crate::reader::RangeReader;
use crate::source::ObjectSource;
use crate::store::EstimateStore;
use crate::task::BatchTask;

#[derive(Clone)]
pub struct BatchWorker {
    source: Arc<dyn ObjectSource>,
    store: Arc<dyn EstimateStore>,
    store_batch_size: usize,
    progress_interval: u64,
}

impl BatchWorker {
    pub fn new(source: Arc<dyn ObjectSource>, store: Arc<dyn EstimateStore>, config: &IngestConfig) -> Self {
        Self {
            source,
            store,
            store_batch_size: config.store_batch_size.max(1),
            progress_interval: config.progress_interval.max(1),
        }
    }

    /// Process one task and signal its outcome
    #[instrument(
        skip_all,
        fields(url = %task.file.url(), range = %task.range, token = %task.token())
    )]
    pub async fn process(&self, task: BatchTask) {
        let (file, range, handle) = task.into_parts();

        let signal = match self.load_range(&file, range).await {
            Ok(records) => {
                info!(records, "Batch complete, signalling success");
                handle.succeed(records)
            },
            Err(e) => {
                error!(error = %e, "Batch failed, signalling failure");
                handle.fail(e.to_string())
            },
        };

        if let Err(e) = signal {
            error!(error = %e, "Protocol violation: completion signal was not delivered");
        }
    }

    /// Read `range` and upsert every row; returns the number of records written.
    ///
    /// All records of one call share a single `created_at`.
    pub async fn load_range(&self, file: &FileReference, range: LineRange) -> Result<u64> {
        let created_at = Utc::now();
        let mut reader = RangeReader::open(self.source.as_ref(), file, range).await?;

        let mut pending = Vec::with_capacity(self.store_batch_size);
        let mut written = 0u64;

        while let Some(row) = reader.next_row().await? {
            pending.push(row.into_record(&file.object_key, created_at));

            if pending.len() >= self.store_batch_size {
                self.store.upsert_batch(&pending).await?;
                written += pending.len() as u64;
                pending.clear();
            }

            if reader.rows_read() % self.progress_interval == 0 {
                info!("Processed {} rows", reader.rows_read());
            }
        }

        if !pending.is_empty() {
            self.store.upsert_batch(&pending).await?;
            written += pending.len() as u64;
        }

        if reader.is_short() {
            warn!(
                expected = range.line_count(),
                written,
                "Short read: stream ended before line {}",
                range.end
            );
        }

        info!("Total rows processed: {}", written);
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IngestError;
    use crate::source::MemorySource;
    use crate::store::MemoryStore;
    use crate::task::{completion_channel, CompletionHandle};
    use crate::types::{CompletionToken, EstimateRecord, RecordKey, TaskOutcome};
    use async_trait::async_trait;

    struct FailingStore;

    #[async_trait]
    impl EstimateStore for FailingStore {
        async fn upsert(&self, _record: &EstimateRecord) -> Result<()> {
            Err(IngestError::StoreWrite("throughput exceeded".to_string()))
        }

        async fn get(&self, _key: &RecordKey) -> Result<Option<EstimateRecord>> {
            Ok(None)
        }

        fn kind(&self) -> &'static str {
            "failing"
        }
    }

    fn csv_lines(count: u64) -> String {
        (0..count)
            .map(|n| format!("{n},{},0.8,medium,300000,290000,310000\n", 5000 + n))
            .collect()
    }

    async fn setup(contents: &str) -> (Arc<MemorySource>, FileReference) {
        let source = MemorySource::new();
        let file = FileReference::new("landing", "estimates.csv");
        source.insert(file.clone(), contents).await;
        (Arc::new(source), file)
    }

    fn task(file: &FileReference, start: u64, end: u64) -> (BatchTask, tokio::sync::mpsc::UnboundedReceiver<crate::task::CompletionSignal>) {
        let (sender, rx) = completion_channel();
        let task = BatchTask::new(
            file.clone(),
            LineRange::new(start, end).unwrap(),
            CompletionHandle::new(CompletionToken::mint(), sender),
        );
        (task, rx)
    }

    fn config() -> IngestConfig {
        IngestConfig::default().with_store_batch_size(4)
    }

    #[tokio::test]
    async fn test_process_upserts_range_and_signals_success() {
        let (source, file) = setup(&csv_lines(20)).await;
        let store = Arc::new(MemoryStore::new());
        let worker = BatchWorker::new(source, store.clone(), &config());

        let (task, mut rx) = task(&file, 5, 14);
        let token = task.token();
        worker.process(task).await;

        let signal = rx.recv().await.unwrap();
        assert_eq!(signal.token, token);
        assert_eq!(signal.outcome, TaskOutcome::Succeeded { records: 10 });
        assert!(rx.try_recv().is_err());

        let records = store.snapshot().await;
        assert_eq!(records.len(), 10);
        assert!(records.iter().all(|r| r.source_file_key == "estimates.csv"));
        assert!(records.iter().all(|r| r.created_at == records[0].created_at));
        assert!(store.get(&RecordKey::new("5005", "estimates.csv")).await.unwrap().is_some());
        assert!(store.get(&RecordKey::new("5004", "estimates.csv")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_short_read_still_succeeds() {
        let (source, file) = setup(&csv_lines(49)).await;
        let store = Arc::new(MemoryStore::new());
        let worker = BatchWorker::new(source, store.clone(), &config());

        let (task, mut rx) = task(&file, 0, 49);
        worker.process(task).await;

        assert_eq!(rx.recv().await.unwrap().outcome, TaskOutcome::Succeeded { records: 49 });
        assert_eq!(store.len().await, 49);
    }

    #[tokio::test]
    async fn test_malformed_record_signals_failure() {
        let contents = csv_lines(3) + "not,enough\n" + &csv_lines(2);
        let (source, file) = setup(&contents).await;
        let worker = BatchWorker::new(source, Arc::new(MemoryStore::new()), &config());

        let (task, mut rx) = task(&file, 0, 5);
        worker.process(task).await;

        match rx.recv().await.unwrap().outcome {
            TaskOutcome::Failed { reason } => assert!(reason.contains("line 3")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_source_signals_failure() {
        let worker = BatchWorker::new(Arc::new(MemorySource::new()), Arc::new(MemoryStore::new()), &config());
        let (task, mut rx) = task(&FileReference::new("landing", "gone.csv"), 0, 9);
        worker.process(task).await;

        let signal = rx.recv().await.unwrap();
        assert!(!signal.outcome.is_success());
        assert!(!signal.abandoned);
    }

    #[tokio::test]
    async fn test_store_failure_signals_failure() {
        let (source, file) = setup(&csv_lines(5)).await;
        let worker = BatchWorker::new(source, Arc::new(FailingStore), &config());

        let (task, mut rx) = task(&file, 0, 4);
        worker.process(task).await;

        match rx.recv().await.unwrap().outcome {
            TaskOutcome::Failed { reason } => assert!(reason.contains("throughput exceeded")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_signal_after_run_stopped_waiting_is_contained() {
        let (source, file) = setup(&csv_lines(6)).await;
        let store = Arc::new(MemoryStore::new());
        let worker = BatchWorker::new(source, store.clone(), &config());

        let (task, rx) = task(&file, 0, 5);
        let sender = task.completion_sender();
        drop(rx);
        assert!(sender.is_closed());

        worker.process(task).await;

        assert_eq!(store.len().await, 6);
        assert!(matches!(
            sender.signal(CompletionToken::mint(), TaskOutcome::Succeeded { records: 0 }),
            Err(IngestError::ProtocolViolation(_))
        ));
    }
}
