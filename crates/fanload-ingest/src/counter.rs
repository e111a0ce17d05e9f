//! Line counting over a single sequential pass

use std::sync::Arc;

use fanload_common::FileReference;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{info, instrument};

use crate::error::{IngestError, Result};
use crate::source::ObjectSource;

/// Counts lines in source objects without buffering their contents
#[derive(Clone)]
pub struct LineCounter {
    source: Arc<dyn ObjectSource>,
}

impl LineCounter {
    pub fn new(source: Arc<dyn ObjectSource>) -> Self {
        Self { source }
    }

    #[instrument(skip(self), fields(url = %file.url()))]
    pub async fn count(&self, file: &FileReference) -> Result<u64> {
        info!("Counting lines in file {}", file.url());

        let mut stream = self.source.open(file).await?;
        let count = count_lines(&mut stream)
            .await
            .map_err(|e| IngestError::source_unreadable(file.url(), e))?;

        info!(lines = count, "File contains {} lines.", count);
        Ok(count)
    }
}

/// Count lines in a stream.
///
/// Every `\n` ends a line; trailing bytes after the last `\n` count as one
/// more line. An empty stream has zero lines.
pub async fn count_lines<R>(reader: &mut R) -> std::io::Result<u64>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut lines = 0u64;
    let mut last_byte = None;

    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            break;
        }
        lines += chunk.iter().filter(|&&b| b == b'\n').count() as u64;
        last_byte = chunk.last().copied();
        let consumed = chunk.len();
        reader.consume(consumed);
    }

    if matches!(last_byte, Some(b) if b != b'\n') {
        lines += 1;
    }

    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use std::io::Cursor;

    async fn count_str(input: &str) -> u64 {
        count_lines(&mut Cursor::new(input.as_bytes())).await.unwrap()
    }

    #[tokio::test]
    async fn test_count_lines_terminated_and_unterminated() {
        assert_eq!(count_str("").await, 0);
        assert_eq!(count_str("a").await, 1);
        assert_eq!(count_str("a\n").await, 1);
        assert_eq!(count_str("a\nb").await, 2);
        assert_eq!(count_str("a\nb\n").await, 2);
        assert_eq!(count_str("\n\n\n").await, 3);
        assert_eq!(count_str("a\r\nb\r\n").await, 2);
    }

    #[tokio::test]
    async fn test_count_spans_buffer_boundaries() {
        let input = "1,2,3,4,5,6,7\n".repeat(10_000);
        let mut reader = tokio::io::BufReader::with_capacity(7, Cursor::new(input.into_bytes()));
        assert_eq!(count_lines(&mut reader).await.unwrap(), 10_000);
    }

    #[tokio::test]
    async fn test_counter_reports_missing_object() {
        let counter = LineCounter::new(Arc::new(MemorySource::new()));
        let err = counter.count(&FileReference::new("b", "missing")).await.unwrap_err();
        assert!(matches!(err, IngestError::SourceUnreadable { .. }));
    }

    #[tokio::test]
    async fn test_counter_reports_broken_stream() {
        let source = MemorySource::new();
        let file = FileReference::new("b", "k");
        source.insert_truncated(file.clone(), "a\nb\n").await;

        let counter = LineCounter::new(Arc::new(source));
        let err = counter.count(&file).await.unwrap_err();
        assert!(matches!(err, IngestError::SourceUnreadable { .. }));
    }
}
