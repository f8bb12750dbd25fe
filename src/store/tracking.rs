use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::debug;

use crate::store::StoreError;

/// Durable mapping between a source catalog row and a local product.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct TrackingRecord {
    pub id: i64,
    pub source_id: i64,
    pub local_id: i64,
    pub imported_at: DateTime<Utc>,
    pub last_sync_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackingStats {
    pub total: i64,
    pub recent_imports: i64,
    pub stale: i64,
    pub last_import_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct TrackingStore {
    pool: SqlitePool,
}

impl TrackingStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Explicit upsert keyed by `source_id`. The first call records
    /// `imported_at`; every later call moves `last_sync_at` and re-points
    /// `local_id`, never duplicating the mapping.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Query`] on write failure, including the unique
    /// violation raised when `local_id` is already mapped to another source
    /// row.
    pub async fn upsert(&self, source_id: i64, local_id: i64) -> Result<(), StoreError> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO tracking (source_id, local_id, imported_at, last_sync_at) \
             VALUES (?1, ?2, ?3, ?3) \
             ON CONFLICT (source_id) DO UPDATE SET \
                 local_id = excluded.local_id, \
                 last_sync_at = excluded.last_sync_at",
        )
        .bind(source_id)
        .bind(local_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        debug!(
            target = "caravel.store",
            source_id, local_id, "tracking upserted"
        );
        Ok(())
    }

    /// Three-way lookup: `Ok(Some)` mapped, `Ok(None)` never imported,
    /// `Err` storage failure.
    pub async fn local_id_for(&self, source_id: i64) -> Result<Option<i64>, StoreError> {
        let local = sqlx::query_scalar::<_, i64>("SELECT local_id FROM tracking WHERE source_id = ?1")
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(local)
    }

    pub async fn source_id_for(&self, local_id: i64) -> Result<Option<i64>, StoreError> {
        let source = sqlx::query_scalar::<_, i64>("SELECT source_id FROM tracking WHERE local_id = ?1")
            .bind(local_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(source)
    }

    pub async fn record_for(&self, source_id: i64) -> Result<Option<TrackingRecord>, StoreError> {
        let record = sqlx::query_as::<_, TrackingRecord>(
            "SELECT id, source_id, local_id, imported_at, last_sync_at \
             FROM tracking WHERE source_id = ?1",
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Moves `last_sync_at` without touching the mapping. No-op when the
    /// source id was never tracked.
    pub async fn touch_sync(&self, source_id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE tracking SET last_sync_at = ?1 WHERE source_id = ?2")
            .bind(Utc::now())
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Deletes by whichever keys are given; at least one is required.
    /// Returns how many rows went away.
    pub async fn untrack(
        &self,
        source_id: Option<i64>,
        local_id: Option<i64>,
    ) -> Result<u64, StoreError> {
        let result = match (source_id, local_id) {
            (None, None) => return Err(StoreError::MissingUntrackKey),
            (Some(source), None) => {
                sqlx::query("DELETE FROM tracking WHERE source_id = ?1")
                    .bind(source)
                    .execute(&self.pool)
                    .await?
            }
            (None, Some(local)) => {
                sqlx::query("DELETE FROM tracking WHERE local_id = ?1")
                    .bind(local)
                    .execute(&self.pool)
                    .await?
            }
            (Some(source), Some(local)) => {
                sqlx::query("DELETE FROM tracking WHERE source_id = ?1 AND local_id = ?2")
                    .bind(source)
                    .bind(local)
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(result.rows_affected())
    }

    /// Records whose `last_sync_at` is older than `max_age_hours`, oldest
    /// first, capped at `limit`. Drives the periodic re-sync sweep.
    pub async fn stale_records(
        &self,
        max_age_hours: i64,
        limit: i64,
    ) -> Result<Vec<TrackingRecord>, StoreError> {
        let cutoff = Utc::now() - Duration::hours(max_age_hours);
        let records = sqlx::query_as::<_, TrackingRecord>(
            "SELECT id, source_id, local_id, imported_at, last_sync_at \
             FROM tracking WHERE last_sync_at < ?1 \
             ORDER BY last_sync_at ASC LIMIT ?2",
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn stats(&self, stale_after_hours: i64) -> Result<TrackingStats, StoreError> {
        let now = Utc::now();
        let day_ago = now - Duration::hours(24);
        let stale_cutoff = now - Duration::hours(stale_after_hours);

        let total = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM tracking")
            .fetch_one(&self.pool)
            .await?;
        let recent_imports =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM tracking WHERE imported_at > ?1")
                .bind(day_ago)
                .fetch_one(&self.pool)
                .await?;
        let stale =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM tracking WHERE last_sync_at < ?1")
                .bind(stale_cutoff)
                .fetch_one(&self.pool)
                .await?;
        let last_import_at = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT MAX(imported_at) FROM tracking",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(TrackingStats {
            total,
            recent_imports,
            stale,
            last_import_at,
        })
    }
}
