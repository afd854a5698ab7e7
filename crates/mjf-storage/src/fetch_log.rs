use chrono::{DateTime, Utc};
use mjf_core::FetchLogEntry;
use sqlx::Row;

use crate::{parse_label, Store, StorageError};

impl Store {
    pub async fn record_fetch(&self, entry: &FetchLogEntry) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO fetch_log (timestamp, endpoint_kind, target, outcome, attempts, status_code, error)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.timestamp)
        .bind(entry.endpoint_kind.as_str())
        .bind(&entry.target)
        .bind(entry.outcome.as_str())
        .bind(i64::from(entry.attempts))
        .bind(entry.status_code.map(i64::from))
        .bind(&entry.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Newest entries first.
    pub async fn recent_fetch_log(&self, limit: u32) -> Result<Vec<FetchLogEntry>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT timestamp, endpoint_kind, target, outcome, attempts, status_code, error
              FROM fetch_log
             ORDER BY id DESC
             LIMIT ?
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let kind: String = row.try_get("endpoint_kind")?;
                let outcome: String = row.try_get("outcome")?;
                let attempts: i64 = row.try_get("attempts")?;
                let status_code: Option<i64> = row.try_get("status_code")?;
                Ok(FetchLogEntry {
                    timestamp: row.try_get::<DateTime<Utc>, _>("timestamp")?,
                    endpoint_kind: parse_label(&kind)?,
                    target: row.try_get("target")?,
                    outcome: parse_label(&outcome)?,
                    attempts: attempts as u32,
                    status_code: status_code.map(|c| c as u16),
                    error: row.try_get("error")?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mjf_core::{EndpointKind, FetchOutcome};

    #[tokio::test]
    async fn fetch_log_is_append_only_and_newest_first() {
        let store = Store::in_memory().await.unwrap();
        for (target, outcome) in [("list", FetchOutcome::Success), ("detail-1", FetchOutcome::TokenStale)] {
            store
                .record_fetch(&FetchLogEntry {
                    timestamp: Utc::now(),
                    endpoint_kind: if target == "list" { EndpointKind::List } else { EndpointKind::Detail },
                    target: target.to_string(),
                    outcome,
                    attempts: 1,
                    status_code: Some(404),
                    error: None,
                })
                .await
                .unwrap();
        }

        let entries = store.recent_fetch_log(10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].target, "detail-1");
        assert_eq!(entries[0].outcome, FetchOutcome::TokenStale);
        assert_eq!(entries[1].endpoint_kind, EndpointKind::List);
    }
}
