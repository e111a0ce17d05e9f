//! Postgres destination
//!
//! One row per `(uprn, source_file_name)`. Each `upsert_batch` call runs in
//! its own transaction, with one `INSERT ... ON CONFLICT DO UPDATE` per record
//! so a key repeated inside the batch resolves to its last occurrence.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info};

use super::EstimateStore;
use crate::config::{is_plain_identifier, DatabaseConfig};
use crate::error::{IngestError, Result};
use crate::types::{EstimateRecord, RecordKey};

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    table: String,
    upsert_sql: String,
    select_sql: String,
}

impl PostgresStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&config.url)
            .await?;

        info!(
            max_connections = config.max_connections,
            table = %config.target_table,
            "Database connection pool created"
        );

        Self::from_pool(pool, &config.target_table)
    }

    pub fn from_pool(pool: PgPool, table: &str) -> Result<Self> {
        if !is_plain_identifier(table) {
            return Err(IngestError::InvalidConfiguration(format!(
                "{table:?} is not a plain SQL identifier"
            )));
        }

        Ok(Self {
            pool,
            table: table.to_string(),
            upsert_sql: upsert_statement(table),
            select_sql: format!(
                r#"
                SELECT uprn, source_file_name, created_at, confidence, confidence_band,
                       estimate_value, estimate_range_lower, estimate_range_upper
                FROM {table}
                WHERE uprn = $1 AND source_file_name = $2
                "#
            ),
        })
    }

    /// Create the destination table if it does not exist
    pub async fn ensure_schema(&self) -> Result<()> {
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                uprn TEXT NOT NULL,
                source_file_name TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                confidence TEXT NOT NULL,
                confidence_band TEXT NOT NULL,
                estimate_value TEXT NOT NULL,
                estimate_range_lower TEXT NOT NULL,
                estimate_range_upper TEXT NOT NULL,
                PRIMARY KEY (uprn, source_file_name)
            )
            "#,
            table = self.table
        );
        sqlx::query(&ddl).execute(&self.pool).await?;
        debug!(table = %self.table, "Destination schema ready");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn upsert_statement(table: &str) -> String {
    format!(
        r#"
        INSERT INTO {table} (
            uprn, source_file_name, created_at, confidence, confidence_band,
            estimate_value, estimate_range_lower, estimate_range_upper
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (uprn, source_file_name) DO UPDATE SET
            created_at = EXCLUDED.created_at,
            confidence = EXCLUDED.confidence,
            confidence_band = EXCLUDED.confidence_band,
            estimate_value = EXCLUDED.estimate_value,
            estimate_range_lower = EXCLUDED.estimate_range_lower,
            estimate_range_upper = EXCLUDED.estimate_range_upper
        "#
    )
}

fn bind_record<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    record: &'q EstimateRecord,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(&record.uprn)
        .bind(&record.source_file_key)
        .bind(record.created_at)
        .bind(&record.confidence)
        .bind(&record.confidence_band)
        .bind(&record.estimate_value)
        .bind(&record.estimate_range_lower)
        .bind(&record.estimate_range_upper)
}

#[async_trait]
impl EstimateStore for PostgresStore {
    async fn upsert(&self, record: &EstimateRecord) -> Result<()> {
        bind_record(sqlx::query(&self.upsert_sql), record)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_batch(&self, records: &[EstimateRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for record in records {
            bind_record(sqlx::query(&self.upsert_sql), record)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        debug!(count = records.len(), table = %self.table, "Upserted records");
        Ok(())
    }

    async fn get(&self, key: &RecordKey) -> Result<Option<EstimateRecord>> {
        let row = sqlx::query(&self.select_sql)
            .bind(&key.uprn)
            .bind(&key.source_file_key)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| -> Result<EstimateRecord> {
            Ok(EstimateRecord {
                uprn: row.try_get("uprn")?,
                source_file_key: row.try_get("source_file_name")?,
                created_at: row.try_get("created_at")?,
                confidence: row.try_get("confidence")?,
                confidence_band: row.try_get("confidence_band")?,
                estimate_value: row.try_get("estimate_value")?,
                estimate_range_lower: row.try_get("estimate_range_lower")?,
                estimate_range_upper: row.try_get("estimate_range_upper")?,
            })
        })
        .transpose()
    }

    fn kind(&self) -> &'static str {
        "postgres"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_upsert_statement_targets_composite_key() {
        let sql = upsert_statement("estimates");
        assert!(sql.contains("INSERT INTO estimates"));
        assert!(sql.contains("ON CONFLICT (uprn, source_file_name) DO UPDATE"));
        assert!(sql.contains("confidence = EXCLUDED.confidence"));
    }

    #[tokio::test]
    async fn test_from_pool_rejects_unsafe_table_name() {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/fanload")
            .unwrap();
        let result = PostgresStore::from_pool(pool, "estimates; drop table x");
        assert!(matches!(result, Err(IngestError::InvalidConfiguration(_))));
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_upsert_last_write_wins() {
        let url = std::env::var("DATABASE_URL").unwrap();
        let config = DatabaseConfig {
            url,
            max_connections: 2,
            target_table: "estimates_test".to_string(),
        };
        let store = PostgresStore::connect(&config).await.unwrap();
        store.ensure_schema().await.unwrap();

        let mut record = EstimateRecord {
            uprn: "100".to_string(),
            source_file_key: "test.csv".to_string(),
            created_at: Utc::now(),
            confidence: "0.1".to_string(),
            confidence_band: "low".to_string(),
            estimate_value: "1".to_string(),
            estimate_range_lower: "0".to_string(),
            estimate_range_upper: "2".to_string(),
        };
        store.upsert(&record).await.unwrap();
        record.confidence = "0.9".to_string();
        store.upsert_batch(std::slice::from_ref(&record)).await.unwrap();

        let stored = store.get(&record.key()).await.unwrap().unwrap();
        assert_eq!(stored.confidence, "0.9");
    }
}
