//! Time-series persistence contract consumed by the batch sink.
//!
//! [`ValueStore`] is the narrow seam the sink sees: chunk insertion and a
//! liveness probe. [`SqlValueStore`] is the production implementation:
//! a single multi-row INSERT through the `TagValuesBulk` entry point,
//! falling back to prepared per-row inserts in one transaction when the
//! entry point is not deployed. The fallback is remembered for the process
//! lifetime so every subsequent chunk skips the failed attempt.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use sqlx::{QueryBuilder, SqlitePool};

use crate::model::Sample;
use crate::storage::error::is_missing_relation;
use crate::storage::StoreError;

/// Query contract of the relational time-series destination.
#[async_trait]
pub trait ValueStore: Send + Sync + 'static {
    /// Persist one chunk of samples; all-or-nothing per chunk.
    async fn insert_chunk(&self, samples: &[Sample]) -> Result<(), StoreError>;

    /// Lightweight liveness probe (`SELECT 1`-equivalent).
    async fn probe(&self) -> Result<(), StoreError>;
}

/// sqlx-backed value store writing to `TagValues`.
pub struct SqlValueStore {
    pool: SqlitePool,
    bulk_unavailable: AtomicBool,
}

impl std::fmt::Debug for SqlValueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlValueStore")
            .field(
                "bulk_unavailable",
                &self.bulk_unavailable.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

impl SqlValueStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            bulk_unavailable: AtomicBool::new(false),
        }
    }

    /// Whether the bulk entry point has been observed missing.
    pub fn bulk_unavailable(&self) -> bool {
        self.bulk_unavailable.load(Ordering::Relaxed)
    }

    /// Multi-row INSERT through the bulk entry point.
    async fn insert_bulk(&self, samples: &[Sample]) -> Result<(), StoreError> {
        let mut qb = QueryBuilder::new(
            "INSERT INTO TagValuesBulk (MachineId, TagId, TagName, NodeId, Value, Quality, \
             SourceTimestamp, ServerTimestamp, ReceivedTimestamp) ",
        );
        qb.push_values(samples, |mut row, sample| {
            row.push_bind(sample.machine_id)
                .push_bind(sample.tag_id)
                .push_bind(&sample.tag_name)
                .push_bind(&sample.node_id)
                .push_bind(sample.value.render())
                .push_bind(i64::from(sample.quality.word()))
                .push_bind(sample.source_timestamp)
                .push_bind(sample.server_timestamp)
                .push_bind(sample.received_timestamp);
        });

        qb.build().execute(&self.pool).await.map_err(|e| {
            if is_missing_relation(&e) {
                StoreError::SchemaMissing(e.to_string())
            } else {
                StoreError::from(e)
            }
        })?;

        Ok(())
    }

    /// Per-row prepared INSERT, all rows in a single transaction.
    async fn insert_rows(&self, samples: &[Sample]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        for sample in samples {
            sqlx::query(
                "INSERT INTO TagValues (MachineId, TagId, TagName, NodeId, Value, Quality, \
                 SourceTimestamp, ServerTimestamp, ReceivedTimestamp) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(sample.machine_id)
            .bind(sample.tag_id)
            .bind(&sample.tag_name)
            .bind(&sample.node_id)
            .bind(sample.value.render())
            .bind(i64::from(sample.quality.word()))
            .bind(sample.source_timestamp)
            .bind(sample.server_timestamp)
            .bind(sample.received_timestamp)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl ValueStore for SqlValueStore {
    async fn insert_chunk(&self, samples: &[Sample]) -> Result<(), StoreError> {
        if samples.is_empty() {
            return Ok(());
        }

        if !self.bulk_unavailable.load(Ordering::Relaxed) {
            match self.insert_bulk(samples).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_schema_missing() => {
                    // Remembered for the process lifetime.
                    self.bulk_unavailable.store(true, Ordering::Relaxed);
                    tracing::warn!(
                        error = %e,
                        "Bulk entry point missing, switching to per-row inserts"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        self.insert_rows(samples).await
    }

    async fn probe(&self) -> Result<(), StoreError> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}
