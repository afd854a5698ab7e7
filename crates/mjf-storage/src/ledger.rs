//! Notification ledger: which offers were announced, and the retirement of stale announcements.

use chrono::{DateTime, Utc};
use mjf_core::{NotificationRecord, NotificationStatus, Offer, ReconcileSummary};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::offers::{offer_from_row, OFFER_COLUMNS};
use crate::{parse_label, Store, StorageError};

/// Result of one delivery attempt as reported by the notifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationOutcome {
    Delivered { message_id: Option<String> },
    Failed { error: String },
}

fn record_from_row(row: &SqliteRow) -> Result<NotificationRecord, StorageError> {
    let status: String = row.try_get("status")?;
    let attempts: i64 = row.try_get("attempts")?;
    Ok(NotificationRecord {
        offer_id: row.try_get("offer_id")?,
        status: parse_label(&status)?,
        attempts: attempts as u32,
        message_id: row.try_get("message_id")?,
        last_error: row.try_get("last_error")?,
        delivered_at: row.try_get::<Option<DateTime<Utc>>, _>("delivered_at")?,
        retired_at: row.try_get::<Option<DateTime<Utc>>, _>("retired_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

/// SQL list of the statuses that stop further sends, e.g. `'delivered', 'retired'`.
fn blocking_statuses() -> String {
    NotificationStatus::ALL
        .into_iter()
        .filter(|status| status.blocks_sending())
        .map(|status| format!("'{}'", status.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

impl Store {
    /// Active offers with fetched detail that have no delivered or retired record.
    ///
    /// Offers with fewer send attempts come first, so records that keep failing rotate to the
    /// back instead of filling every batch.
    pub async fn qualifying(&self, limit: Option<u32>) -> Result<Vec<Offer>, StorageError> {
        let sql = format!(
            "SELECT {OFFER_COLUMNS}
               FROM offers o
               LEFT JOIN notifications n ON n.offer_id = o.offer_id
              WHERE o.is_active = 1
                AND o.detail_fetched = 1
                AND (n.status IS NULL OR n.status NOT IN ({blocking}))
              ORDER BY COALESCE(n.attempts, 0), o.first_seen_at, o.offer_id
              LIMIT ?",
            blocking = blocking_statuses()
        );
        let rows = sqlx::query(&sql)
            .bind(limit.map(i64::from).unwrap_or(-1))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(offer_from_row).collect()
    }

    /// Create the `pending` record for an offer that just qualified. Existing records are kept.
    pub async fn open_notification(&self, offer_id: &str) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO notifications (offer_id, status, attempts, updated_at)
            VALUES (?, 'pending', 0, ?)
            ON CONFLICT(offer_id) DO NOTHING
            "#,
        )
        .bind(offer_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a delivery attempt. Delivered and retired records are never downgraded.
    ///
    /// Returns the status stored after the write.
    pub async fn record_outcome(
        &self,
        offer_id: &str,
        outcome: &NotificationOutcome,
    ) -> Result<NotificationStatus, StorageError> {
        let now = Utc::now();
        let (status, message_id, last_error, delivered_at) = match outcome {
            NotificationOutcome::Delivered { message_id } => {
                (NotificationStatus::Delivered, message_id.clone(), None, Some(now))
            }
            NotificationOutcome::Failed { error } => (NotificationStatus::Failed, None, Some(error.clone()), None),
        };

        let sql = format!(
            "INSERT INTO notifications (offer_id, status, attempts, message_id, last_error, delivered_at, updated_at)
             VALUES (?1, ?2, 1, ?3, ?4, ?5, ?6)
             ON CONFLICT(offer_id) DO UPDATE SET
                 status = excluded.status,
                 attempts = notifications.attempts + 1,
                 message_id = COALESCE(excluded.message_id, notifications.message_id),
                 last_error = excluded.last_error,
                 delivered_at = COALESCE(excluded.delivered_at, notifications.delivered_at),
                 updated_at = excluded.updated_at
             WHERE notifications.status NOT IN ({blocking})",
            blocking = blocking_statuses()
        );
        sqlx::query(&sql)
        .bind(offer_id)
        .bind(status.as_str())
        .bind(message_id)
        .bind(last_error)
        .bind(delivered_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let stored: String = sqlx::query_scalar("SELECT status FROM notifications WHERE offer_id = ?")
            .bind(offer_id)
            .fetch_one(&self.pool)
            .await?;
        parse_label(&stored)
    }

    /// Retire every delivered or failed record whose offer is no longer active. Idempotent.
    pub async fn reconcile(&self) -> Result<ReconcileSummary, StorageError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE notifications
               SET status = 'retired', retired_at = ?, updated_at = ?
             WHERE status IN ('delivered', 'failed')
               AND offer_id IN (SELECT offer_id FROM offers WHERE is_active = 0)
            "#,
        )
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(ReconcileSummary {
            retired: result.rows_affected() as usize,
        })
    }

    pub async fn notification(&self, offer_id: &str) -> Result<Option<NotificationRecord>, StorageError> {
        let row = sqlx::query("SELECT * FROM notifications WHERE offer_id = ?")
            .bind(offer_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// Retired records whose external message still exists.
    pub async fn retractable(&self) -> Result<Vec<NotificationRecord>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM notifications WHERE status = 'retired' AND message_id IS NOT NULL ORDER BY retired_at",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn clear_message_id(&self, offer_id: &str) -> Result<(), StorageError> {
        sqlx::query("UPDATE notifications SET message_id = NULL, updated_at = ? WHERE offer_id = ?")
            .bind(Utc::now())
            .bind(offer_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offers::sample_summary;
    use mjf_core::OfferDetail;

    async fn store_with_details(ids: &[&str]) -> Store {
        let store = Store::in_memory().await.unwrap();
        let summaries: Vec<_> = ids.iter().map(|id| sample_summary(id)).collect();
        store.upsert_from_list(&summaries).await.unwrap();
        for id in ids {
            store.record_detail(id, &OfferDetail::default()).await.unwrap();
        }
        store
    }

    fn delivered(message_id: &str) -> NotificationOutcome {
        NotificationOutcome::Delivered {
            message_id: Some(message_id.to_string()),
        }
    }

    fn ids(offers: &[Offer]) -> Vec<&str> {
        offers.iter().map(|o| o.offer_id.as_str()).collect()
    }

    #[tokio::test]
    async fn qualifying_requires_fetched_detail() {
        let store = Store::in_memory().await.unwrap();
        store
            .upsert_from_list(&[sample_summary("1"), sample_summary("2")])
            .await
            .unwrap();
        store.record_detail("2", &OfferDetail::default()).await.unwrap();

        assert_eq!(ids(&store.qualifying(None).await.unwrap()), vec!["2"]);
    }

    #[tokio::test]
    async fn qualifying_never_yields_delivered_or_retired() {
        let store = store_with_details(&["1", "2", "3"]).await;

        store.open_notification("1").await.unwrap();
        store.record_outcome("1", &delivered("m1")).await.unwrap();
        store
            .record_outcome("2", &NotificationOutcome::Failed { error: "502".into() })
            .await
            .unwrap();
        assert_eq!(ids(&store.qualifying(None).await.unwrap()), vec!["3", "2"]);

        store.upsert_from_list(&[sample_summary("1"), sample_summary("3")]).await.unwrap();
        store.reconcile().await.unwrap();
        store.upsert_from_list(&[sample_summary("1"), sample_summary("2"), sample_summary("3")]).await.unwrap();

        // "2" is active again but its record is retired.
        assert_eq!(ids(&store.qualifying(None).await.unwrap()), vec!["3"]);
    }

    #[test]
    fn blocking_statuses_are_delivered_and_retired() {
        assert_eq!(blocking_statuses(), "'delivered', 'retired'");
    }

    #[tokio::test]
    async fn repeatedly_failing_offer_does_not_hold_the_batch() {
        let store = store_with_details(&["1", "2", "3"]).await;
        let failed = NotificationOutcome::Failed { error: "400".into() };

        assert_eq!(ids(&store.qualifying(Some(1)).await.unwrap()), vec!["1"]);
        store.open_notification("1").await.unwrap();
        store.record_outcome("1", &failed).await.unwrap();

        assert_eq!(ids(&store.qualifying(Some(1)).await.unwrap()), vec!["2"]);
        store.record_outcome("2", &delivered("m2")).await.unwrap();
        assert_eq!(ids(&store.qualifying(Some(1)).await.unwrap()), vec!["3"]);
        store.record_outcome("3", &failed).await.unwrap();
        store.record_outcome("3", &failed).await.unwrap();

        assert_eq!(ids(&store.qualifying(None).await.unwrap()), vec!["1", "3"]);
    }

    #[tokio::test]
    async fn delivered_is_never_downgraded() {
        let store = store_with_details(&["1"]).await;
        store.open_notification("1").await.unwrap();
        assert_eq!(
            store.record_outcome("1", &delivered("m1")).await.unwrap(),
            NotificationStatus::Delivered
        );
        assert_eq!(
            store
                .record_outcome("1", &NotificationOutcome::Failed { error: "late".into() })
                .await
                .unwrap(),
            NotificationStatus::Delivered
        );

        let record = store.notification("1").await.unwrap().unwrap();
        assert_eq!(record.attempts, 1);
        assert_eq!(record.message_id.as_deref(), Some("m1"));
        assert!(record.last_error.is_none());
    }

    #[tokio::test]
    async fn failed_attempts_accumulate() {
        let store = store_with_details(&["1"]).await;
        store.open_notification("1").await.unwrap();
        for _ in 0..2 {
            store
                .record_outcome("1", &NotificationOutcome::Failed { error: "timeout".into() })
                .await
                .unwrap();
        }
        store.record_outcome("1", &delivered("m9")).await.unwrap();

        let record = store.notification("1").await.unwrap().unwrap();
        assert_eq!(record.status, NotificationStatus::Delivered);
        assert_eq!(record.attempts, 3);
        assert!(record.delivered_at.is_some());
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let store = store_with_details(&["1", "2"]).await;
        store.record_outcome("1", &delivered("m1")).await.unwrap();
        store.record_outcome("2", &delivered("m2")).await.unwrap();
        store.upsert_from_list(&[sample_summary("2")]).await.unwrap();

        assert_eq!(store.reconcile().await.unwrap().retired, 1);
        assert_eq!(store.reconcile().await.unwrap().retired, 0);

        let record = store.notification("1").await.unwrap().unwrap();
        assert_eq!(record.status, NotificationStatus::Retired);
        assert!(record.retired_at.is_some());
        assert_eq!(
            store.notification("2").await.unwrap().unwrap().status,
            NotificationStatus::Delivered
        );
    }

    #[tokio::test]
    async fn announce_then_retire_scenario() {
        // Cycle 1: A and B are listed, detailed and announced.
        let store = store_with_details(&["A", "B"]).await;
        for offer in store.qualifying(None).await.unwrap() {
            store.open_notification(&offer.offer_id).await.unwrap();
            store
                .record_outcome(&offer.offer_id, &delivered(&format!("msg-{}", offer.offer_id)))
                .await
                .unwrap();
        }
        assert_eq!(store.reconcile().await.unwrap().retired, 0);

        // Cycle 2: only B is listed.
        let upsert = store.upsert_from_list(&[sample_summary("B")]).await.unwrap();
        assert_eq!(upsert.deactivated, 1);
        assert!(store.qualifying(None).await.unwrap().is_empty());
        assert_eq!(store.reconcile().await.unwrap().retired, 1);

        let a = store.notification("A").await.unwrap().unwrap();
        let b = store.notification("B").await.unwrap().unwrap();
        assert_eq!(a.status, NotificationStatus::Retired);
        assert_eq!(b.status, NotificationStatus::Delivered);

        let retractable = store.retractable().await.unwrap();
        assert_eq!(retractable.len(), 1);
        assert_eq!(retractable[0].message_id.as_deref(), Some("msg-A"));

        store.clear_message_id("A").await.unwrap();
        assert!(store.retractable().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pending_records_of_inactive_offers_are_left_alone() {
        let store = store_with_details(&["1"]).await;
        store.open_notification("1").await.unwrap();
        store.upsert_from_list(&[]).await.unwrap();

        assert_eq!(store.reconcile().await.unwrap().retired, 0);
        assert_eq!(
            store.notification("1").await.unwrap().unwrap().status,
            NotificationStatus::Pending
        );
    }
}
