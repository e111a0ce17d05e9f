use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::EstimateStore;
use crate::error::Result;
use crate::types::{EstimateRecord, RecordKey};

/// Process-local store, for dry runs and tests
#[derive(Clone, Default)]
pub struct MemoryStore {
    records: Arc<RwLock<HashMap<RecordKey, EstimateRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// All records, sorted by key
    pub async fn snapshot(&self) -> Vec<EstimateRecord> {
        let mut records: Vec<_> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.key().cmp(&b.key()));
        records
    }
}

#[async_trait]
impl EstimateStore for MemoryStore {
    async fn upsert(&self, record: &EstimateRecord) -> Result<()> {
        self.records.write().await.insert(record.key(), record.clone());
        Ok(())
    }

    async fn upsert_batch(&self, records: &[EstimateRecord]) -> Result<()> {
        let mut guard = self.records.write().await;
        for record in records {
            guard.insert(record.key(), record.clone());
        }
        Ok(())
    }

    async fn get(&self, key: &RecordKey) -> Result<Option<EstimateRecord>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(uprn: &str, file: &str, confidence: &str) -> EstimateRecord {
        EstimateRecord {
            uprn: uprn.to_string(),
            source_file_key: file.to_string(),
            created_at: Utc::now(),
            confidence: confidence.to_string(),
            confidence_band: "high".to_string(),
            estimate_value: "250000".to_string(),
            estimate_range_lower: "240000".to_string(),
            estimate_range_upper: "260000".to_string(),
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = MemoryStore::new();
        let rec = record("100", "a.csv", "0.9");

        store.upsert(&rec).await.unwrap();
        let once = store.snapshot().await;
        store.upsert(&rec).await.unwrap();

        assert_eq!(store.snapshot().await, once);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let store = MemoryStore::new();
        store.upsert(&record("100", "a.csv", "0.1")).await.unwrap();
        store.upsert(&record("100", "a.csv", "0.7")).await.unwrap();

        let stored = store.get(&RecordKey::new("100", "a.csv")).await.unwrap().unwrap();
        assert_eq!(stored.confidence, "0.7");
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_same_uprn_in_different_files_are_distinct() {
        let store = MemoryStore::new();
        store
            .upsert_batch(&[record("100", "a.csv", "0.1"), record("100", "b.csv", "0.2")])
            .await
            .unwrap();

        assert_eq!(store.len().await, 2);
        assert!(store.get(&RecordKey::new("100", "c.csv")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_upserts_keep_one_value_per_key() {
        let store = MemoryStore::new();
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.upsert(&record("100", "a.csv", &i.to_string())).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.len().await, 1);
        let stored = store.get(&RecordKey::new("100", "a.csv")).await.unwrap().unwrap();
        assert!(stored.confidence.parse::<u32>().unwrap() < 16);
    }
}
