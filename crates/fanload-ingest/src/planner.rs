//! Batch planning
//!
//! Splits a file of `total` lines into contiguous, inclusive line ranges of at
//! most `batch_size` lines each. Ranges are emitted in ascending order.

use std::sync::Arc;

use fanload_common::{FileReference, LineRange};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::counter::LineCounter;
use crate::error::{IngestError, Result};
use crate::source::ObjectSource;
use crate::types::DispatchItem;

/// Plan ranges covering `[0, total)`.
///
/// Yields `[x, min(x + batch_size - 1, total - 1)]` for `x = 0, batch_size, ...`.
/// Zero lines plan to zero ranges.
pub fn plan(total: u64, batch_size: u64) -> Result<Vec<LineRange>> {
    if batch_size == 0 {
        return Err(IngestError::InvalidConfiguration(
            "batch size must be a positive integer".to_string(),
        ));
    }

    let mut ranges = Vec::with_capacity(batch_count(total, batch_size)?);
    let mut start = 0u64;
    while start < total {
        let end = start.saturating_add(batch_size - 1).min(total - 1);
        ranges.push(LineRange { start, end });
        start = end + 1;
    }

    Ok(ranges)
}

/// Number of ranges `plan` yields: `ceil(total / batch_size)`
///
/// Fails with `InvalidConfiguration` when `batch_size` is zero or the count
/// does not fit in `usize` on this target.
pub fn batch_count(total: u64, batch_size: u64) -> Result<usize> {
    if batch_size == 0 {
        return Err(IngestError::InvalidConfiguration(
            "batch size must be a positive integer".to_string(),
        ));
    }
    let count = total.div_ceil(batch_size);
    usize::try_from(count).map_err(|_| {
        IngestError::InvalidConfiguration(format!(
            "{total} lines in batches of {batch_size} gives {count} batches, too many for this platform"
        ))
    })
}

/// A file's line count and the ranges covering it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePlan {
    pub file: FileReference,
    pub total_lines: u64,
    pub ranges: Vec<LineRange>,
}

impl FilePlan {
    /// The `{bucket, key, start, end}` list handed to fan-out
    pub fn dispatch_items(&self) -> Vec<DispatchItem> {
        self.ranges
            .iter()
            .map(|range| DispatchItem::new(self.file.clone(), *range))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Counts a file's lines and plans its batches
#[derive(Clone)]
pub struct BatchPlanner {
    counter: LineCounter,
    batch_size: u64,
}

impl BatchPlanner {
    /// Fails with `InvalidConfiguration` when `batch_size` is zero
    pub fn new(source: Arc<dyn ObjectSource>, batch_size: u64) -> Result<Self> {
        if batch_size == 0 {
            return Err(IngestError::InvalidConfiguration(
                "batch size must be a positive integer".to_string(),
            ));
        }
        Ok(Self {
            counter: LineCounter::new(source),
            batch_size,
        })
    }

    pub fn batch_size(&self) -> u64 {
        self.batch_size
    }

    #[instrument(skip(self), fields(url = %file.url(), batch_size = self.batch_size))]
    pub async fn plan_file(&self, file: &FileReference) -> Result<FilePlan> {
        let total_lines = self.counter.count(file).await?;
        let ranges = plan(total_lines, self.batch_size)?;

        info!(
            total_lines,
            batches = ranges.len(),
            "Planned {} batch(es) for {}",
            ranges.len(),
            file.url()
        );

        Ok(FilePlan {
            file: file.clone(),
            total_lines,
            ranges,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use proptest::prelude::*;

    #[test]
    fn test_plan_120k_lines_in_50k_batches() {
        let ranges = plan(120_000, 50_000).unwrap();
        assert_eq!(
            ranges,
            vec![
                LineRange { start: 0, end: 49_999 },
                LineRange { start: 50_000, end: 99_999 },
                LineRange { start: 100_000, end: 119_999 },
            ]
        );
    }

    #[test]
    fn test_plan_zero_lines_is_empty() {
        assert!(plan(0, 50_000).unwrap().is_empty());
        assert_eq!(batch_count(0, 50_000).unwrap(), 0);
    }

    #[test]
    fn test_batch_count_is_checked() {
        assert!(matches!(batch_count(10, 0), Err(IngestError::InvalidConfiguration(_))));
        assert_eq!(batch_count(120_000, 50_000).unwrap(), 3);

        let fits = usize::try_from(u64::MAX).is_ok();
        assert_eq!(batch_count(u64::MAX, 1).is_ok(), fits);
        if !fits {
            assert!(matches!(batch_count(u64::MAX, 1), Err(IngestError::InvalidConfiguration(_))));
        }
    }

    #[test]
    fn test_plan_rejects_zero_batch_size() {
        assert!(matches!(plan(10, 0), Err(IngestError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_plan_exact_multiple_and_single_line() {
        assert_eq!(plan(100, 50).unwrap().last(), Some(&LineRange { start: 50, end: 99 }));
        assert_eq!(plan(1, 50_000).unwrap(), vec![LineRange { start: 0, end: 0 }]);
        assert_eq!(plan(3, 1).unwrap().len(), 3);
    }

    #[test]
    fn test_plan_huge_batch_size_does_not_overflow() {
        assert_eq!(plan(5, u64::MAX).unwrap(), vec![LineRange { start: 0, end: 4 }]);
    }

    proptest! {
        #[test]
        fn prop_ranges_cover_exactly(total in 0u64..200_000, batch_size in 1u64..70_000) {
            let ranges = plan(total, batch_size).unwrap();
            prop_assert_eq!(ranges.len(), batch_count(total, batch_size).unwrap());

            let mut next = 0u64;
            for range in &ranges {
                prop_assert_eq!(range.start, next);
                prop_assert!(range.start <= range.end);
                prop_assert!(range.line_count() <= batch_size);
                next = range.end + 1;
            }
            prop_assert_eq!(next, total);
        }
    }

    #[test]
    fn test_new_rejects_zero_batch_size() {
        let result = BatchPlanner::new(Arc::new(MemorySource::new()), 0);
        assert!(matches!(result, Err(IngestError::InvalidConfiguration(_))));
    }

    #[tokio::test]
    async fn test_plan_file_emits_dispatch_items() {
        let source = MemorySource::new();
        let file = FileReference::new("landing", "estimates.csv");
        source.insert(file.clone(), "a\nb\nc\nd\ne").await;

        let planner = BatchPlanner::new(Arc::new(source), 2).unwrap();
        let file_plan = planner.plan_file(&file).await.unwrap();

        assert_eq!(file_plan.total_lines, 5);
        let items = file_plan.dispatch_items();
        assert_eq!(items.len(), 3);
        assert_eq!(items[2], DispatchItem::new(file.clone(), LineRange { start: 4, end: 4 }));
    }

    #[tokio::test]
    async fn test_plan_file_propagates_unreadable_source() {
        let planner = BatchPlanner::new(Arc::new(MemorySource::new()), 10).unwrap();
        let err = planner
            .plan_file(&FileReference::new("landing", "missing.csv"))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::SourceUnreadable { .. }));
    }
}
