//! Ingestion error taxonomy

use std::time::Duration;

use thiserror::Error;

/// Result type alias for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Debug, Error)]
pub enum IngestError {
    /// Source object could not be opened, or the stream broke mid-read
    #[error("Source unreadable: {location}: {message}")]
    SourceUnreadable { location: String, message: String },

    /// A line did not split into the expected field layout
    #[error("Malformed record at line {line}: {message}")]
    MalformedRecord { line: u64, message: String },

    /// Rejected startup parameter; raised before any dispatch
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Completion handle presented twice, never, or for an unknown task
    #[error("Completion protocol violation: {0}")]
    ProtocolViolation(String),

    /// Run gave up waiting with tasks still outstanding
    #[error("Run timed out after {elapsed:?} with {outstanding} task(s) outstanding")]
    TimedOut { elapsed: Duration, outstanding: usize },

    /// At least one batch of the run signalled failure
    #[error("Run failed: {failed} of {total} batch(es) reported failure")]
    RunFailed { failed: usize, total: usize },

    /// Destination store rejected a write
    #[error("Store write failed: {0}")]
    StoreWrite(String),

    /// Arrival notification could not be decoded
    #[error("Invalid arrival event: {0}")]
    InvalidEvent(String),

    /// A launched run could not be observed to its end
    #[error("Run aborted: {0}")]
    RunAborted(String),
}

impl IngestError {
    pub fn source_unreadable(location: impl Into<String>, message: impl std::fmt::Display) -> Self {
        IngestError::SourceUnreadable {
            location: location.into(),
            message: message.to_string(),
        }
    }

    pub fn malformed(line: u64, message: impl Into<String>) -> Self {
        IngestError::MalformedRecord {
            line,
            message: message.into(),
        }
    }

    /// Errors a batch worker turns into a failure signal rather than a fault.
    ///
    /// Store write failures belong here with source failures.
    pub fn is_worker_failure(&self) -> bool {
        matches!(
            self,
            IngestError::SourceUnreadable { .. }
                | IngestError::MalformedRecord { .. }
                | IngestError::StoreWrite(_)
        )
    }
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        IngestError::StoreWrite(err.to_string())
    }
}

impl From<fanload_common::FanloadError> for IngestError {
    fn from(err: fanload_common::FanloadError) -> Self {
        match err {
            fanload_common::FanloadError::Io(e) => IngestError::source_unreadable("io", e),
            other => IngestError::InvalidConfiguration(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_failure_classification() {
        assert!(IngestError::source_unreadable("s3://b/k", "NoSuchKey").is_worker_failure());
        assert!(IngestError::malformed(3, "expected 7 fields, got 2").is_worker_failure());
        assert!(IngestError::StoreWrite("connection reset".into()).is_worker_failure());

        assert!(!IngestError::InvalidConfiguration("batch size".into()).is_worker_failure());
        assert!(!IngestError::ProtocolViolation("duplicate".into()).is_worker_failure());
        assert!(!IngestError::TimedOut {
            elapsed: Duration::from_secs(1),
            outstanding: 2
        }
        .is_worker_failure());
    }

    #[test]
    fn test_invalid_range_maps_to_configuration() {
        let err: IngestError = fanload_common::FanloadError::InvalidRange { start: 2, end: 1 }.into();
        assert!(matches!(err, IngestError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_display_includes_location() {
        let err = IngestError::source_unreadable("s3://landing/a.csv", "access denied");
        assert_eq!(err.to_string(), "Source unreadable: s3://landing/a.csv: access denied");
    }
}
