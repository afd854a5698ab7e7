use chrono::{DateTime, Utc};
use mjf_core::BuildToken;
use sqlx::Row;

use crate::{Store, StorageError};

impl Store {
    /// Last persisted build token, or the empty token when none was ever stored.
    pub async fn load_token(&self) -> Result<BuildToken, StorageError> {
        let row = sqlx::query("SELECT value, fetched_at FROM build_tokens WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(BuildToken {
                value: row.try_get("value")?,
                fetched_at: row.try_get::<Option<DateTime<Utc>>, _>("fetched_at")?,
            }),
            None => Ok(BuildToken::empty()),
        }
    }

    pub async fn save_token(&self, token: &BuildToken) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO build_tokens (id, value, fetched_at)
            VALUES (1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                value = excluded.value,
                fetched_at = excluded.fetched_at
            "#,
        )
        .bind(&token.value)
        .bind(token.fetched_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Store an operator-supplied token only if nothing usable is persisted yet.
    ///
    /// Returns whether the seed was applied.
    pub async fn seed_token(&self, value: &str) -> Result<bool, StorageError> {
        let value = value.trim();
        if value.is_empty() {
            return Ok(false);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO build_tokens (id, value, fetched_at)
            VALUES (1, ?, NULL)
            ON CONFLICT(id) DO UPDATE SET
                value = excluded.value,
                fetched_at = NULL
            WHERE trim(build_tokens.value) = ''
            "#,
        )
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
