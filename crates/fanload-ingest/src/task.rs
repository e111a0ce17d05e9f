//! Batch tasks and their completion handles
//!
//! Every dispatched [`BatchTask`] owns one [`CompletionHandle`]. Presenting
//! the handle consumes it, so a worker can signal at most once per handle. A
//! handle dropped without being presented still reports a failure, logged as
//! a protocol violation, so no task stays outstanding without a signal.

use fanload_common::{FileReference, LineRange};
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::error::{IngestError, Result};
use crate::types::{CompletionToken, DispatchItem, TaskOutcome, WorkerInvocation};

/// Reason recorded for a handle that was dropped unpresented
pub const ABANDONED_REASON: &str = "completion handle dropped without being presented";

/// A success or failure report keyed by token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionSignal {
    pub token: CompletionToken,
    pub outcome: TaskOutcome,
    /// Sent by a dropped handle rather than by a worker
    pub abandoned: bool,
}

/// Delivers completion signals back to one run's tracker
#[derive(Debug, Clone)]
pub struct CompletionSender {
    tx: mpsc::UnboundedSender<CompletionSignal>,
}

pub(crate) fn completion_channel() -> (CompletionSender, mpsc::UnboundedReceiver<CompletionSignal>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CompletionSender { tx }, rx)
}

impl CompletionSender {
    /// Report an outcome for `token`.
    ///
    /// Fails with `ProtocolViolation` once the run has stopped waiting.
    pub fn signal(&self, token: CompletionToken, outcome: TaskOutcome) -> Result<()> {
        self.send(CompletionSignal {
            token,
            outcome,
            abandoned: false,
        })
    }

    fn send(&self, signal: CompletionSignal) -> Result<()> {
        let token = signal.token;
        self.tx.send(signal).map_err(|_| {
            IngestError::ProtocolViolation(format!(
                "task {token} signalled after its run stopped waiting"
            ))
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Single-use right to signal one task's completion
#[derive(Debug)]
pub struct CompletionHandle {
    token: CompletionToken,
    sender: CompletionSender,
    presented: bool,
}

impl CompletionHandle {
    pub(crate) fn new(token: CompletionToken, sender: CompletionSender) -> Self {
        Self {
            token,
            sender,
            presented: false,
        }
    }

    pub fn token(&self) -> CompletionToken {
        self.token
    }

    pub fn succeed(self, records: u64) -> Result<()> {
        self.present(TaskOutcome::Succeeded { records })
    }

    pub fn fail(self, reason: impl Into<String>) -> Result<()> {
        self.present(TaskOutcome::Failed {
            reason: reason.into(),
        })
    }

    pub fn present(mut self, outcome: TaskOutcome) -> Result<()> {
        self.presented = true;
        self.sender.signal(self.token, outcome)
    }
}

impl Drop for CompletionHandle {
    fn drop(&mut self) {
        if self.presented {
            return;
        }

        error!(token = %self.token, "Protocol violation: completion handle dropped without being presented");
        let signal = CompletionSignal {
            token: self.token,
            outcome: TaskOutcome::Failed {
                reason: ABANDONED_REASON.to_string(),
            },
            abandoned: true,
        };
        if self.sender.send(signal).is_err() {
            warn!(token = %self.token, "Run no longer waiting; abandoned task not reported");
        }
    }
}

/// The unit of dispatch: one line range of one file
#[derive(Debug)]
pub struct BatchTask {
    pub file: FileReference,
    pub range: LineRange,
    handle: CompletionHandle,
}

impl BatchTask {
    pub(crate) fn new(file: FileReference, range: LineRange, handle: CompletionHandle) -> Self {
        Self { file, range, handle }
    }

    /// Rebuild a task from its wire payload, e.g. after a queue hop.
    ///
    /// An invalid payload still consumes its token: the failure is signalled
    /// before the error is returned.
    pub fn from_invocation(invocation: WorkerInvocation, sender: CompletionSender) -> Result<Self> {
        let handle = CompletionHandle::new(invocation.token, sender);
        match invocation.payload.validated() {
            Ok(item) => Ok(Self::new(item.file, item.range, handle)),
            Err(e) => {
                let reason = e.to_string();
                if let Err(signal_err) = handle.fail(reason.clone()) {
                    warn!(error = %signal_err, "Could not report invalid payload");
                }
                Err(IngestError::ProtocolViolation(reason))
            },
        }
    }

    /// Wire form: `{payload: {bucket, key, start, end}, token}`
    pub fn invocation(&self) -> WorkerInvocation {
        WorkerInvocation {
            payload: DispatchItem::new(self.file.clone(), self.range),
            token: self.handle.token,
        }
    }

    pub fn token(&self) -> CompletionToken {
        self.handle.token
    }

    /// Sender for out-of-band signalling by token
    pub fn completion_sender(&self) -> CompletionSender {
        self.handle.sender.clone()
    }

    pub fn into_parts(self) -> (FileReference, LineRange, CompletionHandle) {
        (self.file, self.range, self.handle)
    }
}
