use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::debug;

use crate::store::StoreError;

/// Outcome of the latest forward attempt for one local order.
/// `status` is one of `pending`, `success`, `failed`.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct OrderSyncRecord {
    pub id: i64,
    pub order_id: i64,
    pub partner_reference: Option<String>,
    pub status: String,
    pub last_error: Option<String>,
    pub retry_count: i64,
    pub synced_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct OrderSyncStore {
    pool: SqlitePool,
}

impl OrderSyncStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Explicit upsert keyed by `order_id`: every forward attempt replaces
    /// the previous outcome wholesale, so a failed row flips to success on a
    /// later retry and vice versa.
    pub async fn upsert(
        &self,
        order_id: i64,
        status: &str,
        partner_reference: Option<&str>,
        last_error: Option<&str>,
        retry_count: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO order_sync \
                 (order_id, partner_reference, status, last_error, retry_count, synced_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT (order_id) DO UPDATE SET \
                 partner_reference = excluded.partner_reference, \
                 status = excluded.status, \
                 last_error = excluded.last_error, \
                 retry_count = excluded.retry_count, \
                 synced_at = excluded.synced_at",
        )
        .bind(order_id)
        .bind(partner_reference)
        .bind(status)
        .bind(last_error)
        .bind(retry_count)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        debug!(
            target = "caravel.store",
            order_id, status, retry_count, "order sync upserted"
        );
        Ok(())
    }

    /// Three-way lookup: `Ok(Some)` forwarded at least once, `Ok(None)`
    /// never attempted, `Err` storage failure.
    pub async fn record_for_order(
        &self,
        order_id: i64,
    ) -> Result<Option<OrderSyncRecord>, StoreError> {
        let record = sqlx::query_as::<_, OrderSyncRecord>(
            "SELECT id, order_id, partner_reference, status, last_error, retry_count, synced_at \
             FROM order_sync WHERE order_id = ?1",
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Every record not yet in `success`, oldest attempt first. Feeds the
    /// bulk retry path.
    pub async fn non_success(&self) -> Result<Vec<OrderSyncRecord>, StoreError> {
        let records = sqlx::query_as::<_, OrderSyncRecord>(
            "SELECT id, order_id, partner_reference, status, last_error, retry_count, synced_at \
             FROM order_sync WHERE status != 'success' ORDER BY synced_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_pool;

    #[tokio::test]
    async fn failed_row_is_overwritten_by_success() {
        let store = OrderSyncStore::new(test_pool().await);
        store
            .upsert(1001, "failed", None, Some("partner timeout"), 1)
            .await
            .expect("failed upsert");

        let record = store
            .record_for_order(1001)
            .await
            .expect("lookup")
            .expect("present");
        assert_eq!(record.status, "failed");
        assert_eq!(record.last_error.as_deref(), Some("partner timeout"));
        assert_eq!(record.retry_count, 1);

        store
            .upsert(1001, "success", Some("DSZ-REF-9"), None, 1)
            .await
            .expect("success upsert");

        let record = store
            .record_for_order(1001)
            .await
            .expect("lookup")
            .expect("present");
        assert_eq!(record.status, "success");
        assert_eq!(record.partner_reference.as_deref(), Some("DSZ-REF-9"));
        assert!(record.last_error.is_none());

        let remaining = store.non_success().await.expect("non success");
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn unknown_order_reads_as_none() {
        let store = OrderSyncStore::new(test_pool().await);
        assert!(
            store
                .record_for_order(555)
                .await
                .expect("lookup")
                .is_none()
        );
    }

    #[tokio::test]
    async fn non_success_lists_pending_and_failed() {
        let store = OrderSyncStore::new(test_pool().await);
        store.upsert(1, "pending", None, None, 0).await.expect("up");
        store
            .upsert(2, "failed", None, Some("boom"), 2)
            .await
            .expect("up");
        store
            .upsert(3, "success", Some("R-3"), None, 0)
            .await
            .expect("up");

        let records = store.non_success().await.expect("non success");
        let ids: Vec<i64> = records.iter().map(|r| r.order_id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&1));
        assert!(ids.contains(&2));
    }
}
