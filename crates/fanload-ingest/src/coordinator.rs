//! Fan-out coordinator
//!
//! One run per file:
//!
//! ```text
//! Planning -> Dispatching -> AwaitingCompletion -> Completed | Failed | TimedOut
//!     \_________ zero ranges ________________________/
//! ```
//!
//! Dispatch is fire-and-forget; the coordinator then waits for one signal per
//! task. A failure does not cancel the other tasks: the run waits for all of
//! them before concluding `Failed`. A timeout only stops the waiting, workers
//! already dispatched keep running.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use fanload_common::{FileReference, LineRange};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::IngestConfig;
use crate::error::Result;
use crate::planner::BatchPlanner;
use crate::source::ObjectSource;
use crate::store::EstimateStore;
use crate::task::{completion_channel, BatchTask, CompletionHandle, CompletionSender, CompletionSignal};
use crate::types::{CompletionToken, RunOutcome, RunStatus, TaskOutcome, TaskReport};
use crate::worker::BatchWorker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Planning,
    Dispatching,
    AwaitingCompletion,
    Completed,
    Failed,
    TimedOut,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed | RunState::TimedOut)
    }
}

impl From<RunStatus> for RunState {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Completed => RunState::Completed,
            RunStatus::Failed => RunState::Failed,
            RunStatus::TimedOut => RunState::TimedOut,
        }
    }
}

/// Hands tasks to workers without waiting for them
pub trait Dispatcher: Send + Sync {
    /// Take ownership of `task`. A task dropped here still signals failure
    /// through its handle.
    fn dispatch(&self, task: BatchTask) -> Result<()>;
}

/// Runs each task on the tokio runtime, optionally capped at
/// `max_concurrency` tasks in flight across all runs sharing the pool
#[derive(Clone)]
pub struct WorkerPool {
    worker: Arc<BatchWorker>,
    permits: Option<Arc<Semaphore>>,
}

impl WorkerPool {
    pub fn new(worker: BatchWorker, max_concurrency: Option<usize>) -> Self {
        Self {
            worker: Arc::new(worker),
            permits: max_concurrency.map(|n| Arc::new(Semaphore::new(n))),
        }
    }
}

impl Dispatcher for WorkerPool {
    fn dispatch(&self, task: BatchTask) -> Result<()> {
        let worker = Arc::clone(&self.worker);
        let permits = self.permits.clone();

        tokio::spawn(async move {
            let _permit = match permits {
                Some(semaphore) => match semaphore.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(e) => {
                        warn!(token = %task.token(), error = %e, "Worker pool closed before task started");
                        return;
                    },
                },
                None => None,
            };
            worker.process(task).await;
        });

        Ok(())
    }
}

/// Outstanding-set bookkeeping for one run
pub struct RunTracker {
    sender: CompletionSender,
    receiver: mpsc::UnboundedReceiver<CompletionSignal>,
    reports: Vec<TaskReport>,
    index: HashMap<CompletionToken, usize>,
    outstanding: usize,
    violations: usize,
}

/// What a tracker saw by the time it stopped waiting
#[derive(Debug)]
pub struct TrackerSummary {
    pub reports: Vec<TaskReport>,
    pub protocol_violations: usize,
    pub outstanding: usize,
}

impl TrackerSummary {
    /// `TimedOut` if anything is outstanding, else `Failed` on any failure
    pub fn status(&self) -> RunStatus {
        if self.outstanding > 0 {
            RunStatus::TimedOut
        } else if self
            .reports
            .iter()
            .any(|r| matches!(r.outcome, Some(TaskOutcome::Failed { .. })))
        {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        }
    }
}

impl Default for RunTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RunTracker {
    pub fn new() -> Self {
        let (sender, receiver) = completion_channel();
        Self {
            sender,
            receiver,
            reports: Vec::new(),
            index: HashMap::new(),
            outstanding: 0,
            violations: 0,
        }
    }

    /// Mint a fresh handle for `range` and register it as outstanding
    pub fn new_task(&mut self, file: FileReference, range: LineRange) -> BatchTask {
        let token = CompletionToken::mint();
        self.index.insert(token, self.reports.len());
        self.reports.push(TaskReport {
            token,
            range,
            outcome: None,
        });
        self.outstanding += 1;
        BatchTask::new(file, range, CompletionHandle::new(token, self.sender.clone()))
    }

    pub fn sender(&self) -> CompletionSender {
        self.sender.clone()
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    fn apply(&mut self, signal: CompletionSignal) {
        let Some(&slot) = self.index.get(&signal.token) else {
            self.violations += 1;
            error!(token = %signal.token, "Protocol violation: signal for unknown task");
            return;
        };

        let report = &mut self.reports[slot];
        if report.outcome.is_some() {
            self.violations += 1;
            error!(
                token = %signal.token,
                range = %report.range,
                "Protocol violation: completion handle presented more than once"
            );
            return;
        }

        if signal.abandoned {
            self.violations += 1;
        }

        debug!(
            token = %signal.token,
            range = %report.range,
            success = signal.outcome.is_success(),
            "Task signalled"
        );
        report.outcome = Some(signal.outcome);
        self.outstanding -= 1;
    }

    /// Wait until every task has signalled or `deadline` passes.
    ///
    /// Dropping the tracker closes the channel, so signals sent after this
    /// returns are rejected at the sender.
    pub async fn await_all(mut self, deadline: Instant) -> TrackerSummary {
        while self.outstanding > 0 {
            match timeout_at(deadline, self.receiver.recv()).await {
                Ok(Some(signal)) => self.apply(signal),
                Ok(None) => break,
                Err(_) => {
                    warn!(outstanding = self.outstanding, "Timed out waiting for completion signals");
                    break;
                },
            }
        }

        while let Ok(signal) = self.receiver.try_recv() {
            self.apply(signal);
        }

        TrackerSummary {
            reports: self.reports,
            protocol_violations: self.violations,
            outstanding: self.outstanding,
        }
    }
}

pub struct FanoutCoordinator {
    planner: BatchPlanner,
    dispatcher: Arc<dyn Dispatcher>,
    config: IngestConfig,
}

impl FanoutCoordinator {
    /// Fails with `InvalidConfiguration` before anything is dispatched
    pub fn new(planner: BatchPlanner, dispatcher: Arc<dyn Dispatcher>, config: IngestConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            planner,
            dispatcher,
            config,
        })
    }

    /// Coordinator backed by an in-process [`WorkerPool`]
    pub fn with_worker_pool(
        source: Arc<dyn ObjectSource>,
        store: Arc<dyn EstimateStore>,
        config: IngestConfig,
    ) -> Result<Self> {
        config.validate()?;
        let planner = BatchPlanner::new(Arc::clone(&source), config.batch_size)?;
        let worker = BatchWorker::new(source, store, &config);
        let pool = WorkerPool::new(worker, config.max_concurrency);
        Self::new(planner, Arc::new(pool), config)
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Run one file to a terminal status.
    ///
    /// `Err` means the run never dispatched: an unreadable source during
    /// planning or an invalid setting. Batch failures and timeouts come back
    /// as `Ok` with the matching [`RunStatus`].
    #[instrument(skip(self), fields(run_id = tracing::field::Empty, url = %file.url()))]
    pub async fn run(&self, file: &FileReference) -> Result<RunOutcome> {
        let run_id = Uuid::new_v4();
        tracing::Span::current().record("run_id", tracing::field::display(run_id));

        let started_at = Utc::now();
        let run_deadline = Instant::now() + self.config.max_run_duration;
        let mut state = RunState::Planning;
        info!(?state, "Run started for {}", file.url());

        let plan = match timeout_at(run_deadline, self.planner.plan_file(file)).await {
            Ok(plan) => plan?,
            Err(_) => {
                transition(&mut state, RunState::TimedOut);
                return Ok(RunOutcome {
                    run_id,
                    file: file.clone(),
                    status: RunStatus::TimedOut,
                    total_lines: None,
                    batches: 0,
                    manifest: Vec::new(),
                    protocol_violations: 0,
                    started_at,
                    finished_at: Utc::now(),
                });
            },
        };

        if plan.is_empty() {
            transition(&mut state, RunState::Completed);
            return Ok(RunOutcome {
                run_id,
                file: file.clone(),
                status: RunStatus::Completed,
                total_lines: Some(plan.total_lines),
                batches: 0,
                manifest: Vec::new(),
                protocol_violations: 0,
                started_at,
                finished_at: Utc::now(),
            });
        }

        transition(&mut state, RunState::Dispatching);
        let batches = plan.ranges.len();
        let mut tracker = RunTracker::new();
        for range in &plan.ranges {
            let task = tracker.new_task(file.clone(), *range);
            debug!(token = %task.token(), range = %range, "Dispatching batch");
            if let Err(e) = self.dispatcher.dispatch(task) {
                error!(range = %range, error = %e, "Dispatch failed");
            }
        }
        info!(batches, "Dispatched {} batch(es)", batches);

        transition(&mut state, RunState::AwaitingCompletion);
        let wait_deadline = (Instant::now() + self.config.run_timeout).min(run_deadline);
        let summary = tracker.await_all(wait_deadline).await;

        let status = summary.status();
        transition(&mut state, status.into());

        let outcome = RunOutcome {
            run_id,
            file: file.clone(),
            status,
            total_lines: Some(plan.total_lines),
            batches,
            manifest: summary.reports,
            protocol_violations: summary.protocol_violations,
            started_at,
            finished_at: Utc::now(),
        };

        info!(
            status = %outcome.status,
            succeeded = outcome.succeeded(),
            failed = outcome.failed(),
            outstanding = outcome.outstanding(),
            records = outcome.records_written(),
            "Run finished"
        );

        Ok(outcome)
    }
}

fn transition(state: &mut RunState, next: RunState) {
    debug_assert!(!state.is_terminal());
    info!(from = ?*state, to = ?next, "Run state transition");
    *state = next;
}
