//! Range reader: skip-then-read over a forward-only stream
//!
//! Each reader opens its own stream, discards the lines before `range.start`
//! without parsing them, then parses one [`EstimateRow`] per line up to and
//! including `range.end`. Skipping costs O(start) bytes read; sources offer no
//! random access.
//!
//! A stream that ends early is a short read: the reader stops and yields what
//! it has. A line that does not split into exactly seven fields aborts the
//! read with [`IngestError::MalformedRecord`].

use fanload_common::{FileReference, LineRange};
use futures::stream::{self, BoxStream, StreamExt};
use tokio::io::AsyncBufReadExt;
use tracing::{debug, info, warn};

use crate::error::{IngestError, Result};
use crate::source::{LineStream, ObjectSource};
use crate::types::{EstimateRow, ESTIMATE_FIELDS};

pub struct RangeReader {
    stream: LineStream,
    file: FileReference,
    range: LineRange,
    /// 0-indexed line the next `read_until` returns
    position: u64,
    buf: Vec<u8>,
    finished: bool,
    rows_read: u64,
}

impl RangeReader {
    /// Open the file and position the stream at `range.start`
    pub async fn open(source: &dyn ObjectSource, file: &FileReference, range: LineRange) -> Result<Self> {
        let stream = source.open(file).await?;
        let mut reader = Self {
            stream,
            file: file.clone(),
            range,
            position: 0,
            buf: Vec::new(),
            finished: false,
            rows_read: 0,
        };

        info!(url = %file.url(), "Seeking to position {}", range.start);
        let skipped = reader.skip_lines(range.start).await?;
        reader.position = skipped;
        if skipped < range.start {
            warn!(
                url = %file.url(),
                skipped,
                "Stream ended while seeking to line {}",
                range.start
            );
            reader.finished = true;
        }

        info!(url = %file.url(), "Starting reading from {} to {}", range.start, range.end);
        Ok(reader)
    }

    /// Discard up to `count` lines; returns how many were discarded
    async fn skip_lines(&mut self, count: u64) -> Result<u64> {
        let mut skipped = 0u64;
        while skipped < count {
            let chunk = self
                .stream
                .fill_buf()
                .await
                .map_err(|e| IngestError::source_unreadable(self.file.url(), e))?;
            if chunk.is_empty() {
                break;
            }

            let mut consumed = chunk.len();
            for (i, &byte) in chunk.iter().enumerate() {
                if byte == b'\n' {
                    skipped += 1;
                    if skipped == count {
                        consumed = i + 1;
                        break;
                    }
                }
            }
            self.stream.consume(consumed);
        }
        Ok(skipped)
    }

    /// Next row in range, or `None` once `range.end` is passed or the stream ends
    pub async fn next_row(&mut self) -> Result<Option<EstimateRow>> {
        if self.finished || self.position > self.range.end {
            return Ok(None);
        }

        self.buf.clear();
        let read = self
            .stream
            .read_until(b'\n', &mut self.buf)
            .await
            .map_err(|e| IngestError::source_unreadable(self.file.url(), e))?;

        if read == 0 {
            self.finished = true;
            debug!(
                url = %self.file.url(),
                rows_read = self.rows_read,
                expected = self.range.line_count(),
                "Short read: stream ended at line {}",
                self.position
            );
            return Ok(None);
        }

        let line = self.position;
        self.position += 1;
        let row = parse_line(&self.buf, line)?;
        self.rows_read += 1;
        Ok(Some(row))
    }

    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    pub fn range(&self) -> LineRange {
        self.range
    }

    /// True when the stream ended before `range.end`
    pub fn is_short(&self) -> bool {
        self.finished && self.position <= self.range.end
    }

    /// Lazy stream of the remaining rows; ends after the first error
    pub fn into_stream(self) -> BoxStream<'static, Result<EstimateRow>> {
        stream::try_unfold(self, |mut reader| async move {
            Ok(reader.next_row().await?.map(|row| (row, reader)))
        })
        .boxed()
    }
}

/// Open `file` and stream the rows of `range`
pub async fn read(
    source: &dyn ObjectSource,
    file: &FileReference,
    range: LineRange,
) -> Result<BoxStream<'static, Result<EstimateRow>>> {
    Ok(RangeReader::open(source, file, range).await?.into_stream())
}

/// Parse one raw line (terminator included or not) into a row
pub fn parse_line(raw: &[u8], line: u64) -> Result<EstimateRow> {
    let trimmed = raw
        .strip_suffix(b"\n")
        .map(|l| l.strip_suffix(b"\r").unwrap_or(l))
        .unwrap_or(raw);

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(trimmed);

    let mut record = csv::StringRecord::new();
    let found = reader
        .read_record(&mut record)
        .map_err(|e| IngestError::malformed(line, e.to_string()))?;
    if !found {
        return Err(IngestError::malformed(line, "empty line"));
    }

    // csv treats a bare `\r` as a terminator; anything after it is not a row
    let mut trailing = csv::StringRecord::new();
    let has_trailing = reader
        .read_record(&mut trailing)
        .map_err(|e| IngestError::malformed(line, e.to_string()))?;
    if has_trailing {
        return Err(IngestError::malformed(line, "unexpected data after carriage return"));
    }

    if record.len() != ESTIMATE_FIELDS.len() {
        return Err(IngestError::malformed(
            line,
            format!("expected {} fields, got {}", ESTIMATE_FIELDS.len(), record.len()),
        ));
    }

    record
        .deserialize::<EstimateRow>(None)
        .map_err(|e| IngestError::malformed(line, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use futures::TryStreamExt;

    fn line(n: u64) -> String {
        format!("{n},{},0.9,high,250000,240000,260000\n", 1000 + n)
    }

    fn lines(count: u64) -> String {
        (0..count).map(line).collect()
    }

    async fn source_with(contents: &str) -> (MemorySource, FileReference) {
        let source = MemorySource::new();
        let file = FileReference::new("landing", "estimates.csv");
        source.insert(file.clone(), contents).await;
        (source, file)
    }

    async fn collect(source: &MemorySource, file: &FileReference, start: u64, end: u64) -> Result<Vec<EstimateRow>> {
        read(source, file, LineRange::new(start, end).unwrap())
            .await?
            .try_collect()
            .await
    }

    #[test]
    fn test_parse_line_fields_in_order() {
        let row = parse_line(b"1,100,0.9,high,250000,240000,260000\r\n", 0).unwrap();
        assert_eq!(row.udprn, "1");
        assert_eq!(row.uprn, "100");
        assert_eq!(row.confidence_band, "high");
        assert_eq!(row.estimate_range_upper, "260000");
    }

    #[test]
    fn test_parse_line_quoted_fields() {
        let row = parse_line(b"1,100,0.9,\"high, very\",250000,240000,260000", 4).unwrap();
        assert_eq!(row.confidence_band, "high, very");
    }

    #[test]
    fn test_parse_line_wrong_field_count() {
        let err = parse_line(b"1,100,0.9\n", 7).unwrap_err();
        match err {
            IngestError::MalformedRecord { line, message } => {
                assert_eq!(line, 7);
                assert!(message.contains("got 3"));
            },
            other => panic!("unexpected error: {other}"),
        }
        assert!(parse_line(b"\n", 0).is_err());
        assert!(parse_line(b"1,2,3,4,5,6,7,8", 0).is_err());
    }

    #[test]
    fn test_parse_line_rejects_data_after_bare_carriage_return() {
        let err = parse_line(b"1,100,0.9,high,1,1,1\rjunk,trailing\n", 5).unwrap_err();
        assert!(matches!(err, IngestError::MalformedRecord { line: 5, .. }));

        let err = parse_line(b"1,100,0.9,high,1,1,1\r2,200,0.8,low,2,2,2", 0).unwrap_err();
        assert!(matches!(err, IngestError::MalformedRecord { .. }));

        assert!(parse_line(b"1,100,0.9,high,1,1,1\r", 0).is_ok());
    }

    #[tokio::test]
    async fn test_reads_exact_range_after_skip() {
        let (source, file) = source_with(&lines(10)).await;
        let rows = collect(&source, &file, 3, 6).await.unwrap();

        let udprns: Vec<_> = rows.iter().map(|r| r.udprn.as_str()).collect();
        assert_eq!(udprns, vec!["3", "4", "5", "6"]);
    }

    #[tokio::test]
    async fn test_first_and_last_line() {
        let (source, file) = source_with(&lines(5)).await;
        assert_eq!(collect(&source, &file, 0, 0).await.unwrap()[0].udprn, "0");
        assert_eq!(collect(&source, &file, 4, 4).await.unwrap()[0].udprn, "4");
    }

    #[tokio::test]
    async fn test_unterminated_last_line_is_read() {
        let contents = lines(3) + "3,1003,0.5,low,1,1,1";
        let (source, file) = source_with(&contents).await;
        let rows = collect(&source, &file, 2, 3).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].estimate_value, "1");
    }

    #[tokio::test]
    async fn test_short_read_returns_what_exists() {
        let (source, file) = source_with(&lines(49)).await;

        let mut reader = RangeReader::open(&source, &file, LineRange::new(40, 59).unwrap())
            .await
            .unwrap();
        let mut count = 0;
        while reader.next_row().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 9);
        assert_eq!(reader.rows_read(), 9);
        assert!(reader.is_short());
    }

    #[tokio::test]
    async fn test_start_beyond_end_of_stream_is_empty() {
        let (source, file) = source_with(&lines(5)).await;
        assert!(collect(&source, &file, 10, 19).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_line_aborts_batch() {
        let contents = format!("{}{}bad,line\n{}", line(0), line(1), line(3));
        let (source, file) = source_with(&contents).await;

        let mut reader = RangeReader::open(&source, &file, LineRange::new(0, 3).unwrap())
            .await
            .unwrap();
        assert!(reader.next_row().await.unwrap().is_some());
        assert!(reader.next_row().await.unwrap().is_some());
        assert!(matches!(
            reader.next_row().await,
            Err(IngestError::MalformedRecord { line: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_malformed_line_outside_range_is_not_parsed() {
        let contents = format!("garbage\n{}", line(1));
        let (source, file) = source_with(&contents).await;
        assert_eq!(collect(&source, &file, 1, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_broken_stream_is_source_unreadable() {
        let source = MemorySource::new();
        let file = FileReference::new("landing", "estimates.csv");
        source.insert_truncated(file.clone(), lines(2)).await;

        let err = collect(&source, &file, 0, 9).await.unwrap_err();
        assert!(matches!(err, IngestError::SourceUnreadable { .. }));
    }

    #[tokio::test]
    async fn test_missing_object_fails_on_open() {
        let source = MemorySource::new();
        let result = RangeReader::open(&source, &FileReference::new("b", "k"), LineRange::new(0, 1).unwrap()).await;
        assert!(matches!(result, Err(IngestError::SourceUnreadable { .. })));
    }
}
