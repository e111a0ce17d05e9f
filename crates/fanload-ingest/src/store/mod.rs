//! Destination store for parsed estimate records
//!
//! Stores are keyed by `(uprn, source_file_key)` and overwrite on key
//! collision: the last write for a key wins, nothing is merged. Stores must
//! accept concurrent upserts from many workers.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{EstimateRecord, RecordKey};

#[async_trait]
pub trait EstimateStore: Send + Sync {
    /// Insert or overwrite one record
    async fn upsert(&self, record: &EstimateRecord) -> Result<()>;

    /// Insert or overwrite a group of records, in order
    async fn upsert_batch(&self, records: &[EstimateRecord]) -> Result<()> {
        for record in records {
            self.upsert(record).await?;
        }
        Ok(())
    }

    async fn get(&self, key: &RecordKey) -> Result<Option<EstimateRecord>>;

    fn kind(&self) -> &'static str;
}
