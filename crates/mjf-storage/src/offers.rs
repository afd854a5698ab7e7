use std::collections::HashSet;

use chrono::{DateTime, Utc};
use mjf_core::{Language, Offer, OfferDetail, OfferSummary, Skill, UpsertSummary};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::debug;

use crate::{parse_label, Store, StorageError};

pub(crate) const OFFER_COLUMNS: &str = r#"
    o.offer_id, o.slug, o.title, o.company, o.company_logo_url, o.salary_from, o.salary_to,
    o.remote_percentage, o.location, o.is_active, o.detail_fetched, o.first_seen_at,
    o.last_seen_at, o.deactivated_at, o.raw_list_payload
"#;

pub(crate) fn offer_from_row(row: &SqliteRow) -> Result<Offer, StorageError> {
    let raw: String = row.try_get("raw_list_payload")?;
    Ok(Offer {
        offer_id: row.try_get("offer_id")?,
        slug: row.try_get("slug")?,
        title: row.try_get("title")?,
        company: row.try_get("company")?,
        company_logo_url: row.try_get("company_logo_url")?,
        salary_from: row.try_get("salary_from")?,
        salary_to: row.try_get("salary_to")?,
        remote_percentage: row.try_get("remote_percentage")?,
        location: row.try_get("location")?,
        is_active: row.try_get("is_active")?,
        detail_fetched: row.try_get("detail_fetched")?,
        first_seen_at: row.try_get::<DateTime<Utc>, _>("first_seen_at")?,
        last_seen_at: row.try_get::<DateTime<Utc>, _>("last_seen_at")?,
        deactivated_at: row.try_get::<Option<DateTime<Utc>>, _>("deactivated_at")?,
        raw_list_payload: serde_json::from_str(&raw)
            .map_err(|err| StorageError::Corrupt(format!("raw_list_payload: {err}")))?,
    })
}

impl Store {
    /// Apply one complete active-offers list.
    ///
    /// Listed offers become active with a fresh `last_seen_at`; previously active offers that
    /// are not listed become inactive. Runs in a single transaction, so repeating the same
    /// list is a no-op for activity state.
    pub async fn upsert_from_list(&self, summaries: &[OfferSummary]) -> Result<UpsertSummary, StorageError> {
        let now = Utc::now();
        let mut seen: HashSet<&str> = HashSet::with_capacity(summaries.len());
        let mut summary = UpsertSummary::default();

        let mut tx = self.pool.begin().await?;

        for offer in summaries {
            if !seen.insert(offer.offer_id.as_str()) {
                debug!(offer_id = %offer.offer_id, "duplicate offer in list; keeping first occurrence");
                continue;
            }

            let raw = offer.raw.to_string();
            let exists = sqlx::query("SELECT 1 FROM offers WHERE offer_id = ?")
                .bind(&offer.offer_id)
                .fetch_optional(&mut *tx)
                .await?
                .is_some();

            if exists {
                sqlx::query(
                    r#"
                    UPDATE offers
                       SET slug = ?, title = ?, company = ?, company_logo_url = ?,
                           salary_from = ?, salary_to = ?, remote_percentage = ?, location = ?,
                           is_active = 1, deactivated_at = NULL, last_seen_at = ?,
                           raw_list_payload = ?
                     WHERE offer_id = ?
                    "#,
                )
                .bind(&offer.slug)
                .bind(&offer.title)
                .bind(&offer.company)
                .bind(&offer.company_logo_url)
                .bind(offer.salary_from)
                .bind(offer.salary_to)
                .bind(offer.remote_percentage)
                .bind(&offer.location)
                .bind(now)
                .bind(&raw)
                .bind(&offer.offer_id)
                .execute(&mut *tx)
                .await?;
                summary.updated += 1;
            } else {
                sqlx::query(
                    r#"
                    INSERT INTO offers (
                        offer_id, slug, title, company, company_logo_url, salary_from, salary_to,
                        remote_percentage, location, is_active, detail_fetched, first_seen_at,
                        last_seen_at, raw_list_payload
                    )
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1, 0, ?, ?, ?)
                    "#,
                )
                .bind(&offer.offer_id)
                .bind(&offer.slug)
                .bind(&offer.title)
                .bind(&offer.company)
                .bind(&offer.company_logo_url)
                .bind(offer.salary_from)
                .bind(offer.salary_to)
                .bind(offer.remote_percentage)
                .bind(&offer.location)
                .bind(now)
                .bind(now)
                .bind(&raw)
                .execute(&mut *tx)
                .await?;
                summary.created += 1;
            }
        }

        let active: Vec<String> = sqlx::query_scalar("SELECT offer_id FROM offers WHERE is_active = 1")
            .fetch_all(&mut *tx)
            .await?;

        for offer_id in active.iter().filter(|id| !seen.contains(id.as_str())) {
            sqlx::query("UPDATE offers SET is_active = 0, deactivated_at = ? WHERE offer_id = ?")
                .bind(now)
                .bind(offer_id)
                .execute(&mut *tx)
                .await?;
            summary.deactivated += 1;
        }

        tx.commit().await?;
        Ok(summary)
    }

    /// Active offers whose detail has not been retrieved yet, oldest first.
    pub async fn pending_detail_offers(&self, limit: Option<u32>) -> Result<Vec<Offer>, StorageError> {
        let sql = format!(
            "SELECT {OFFER_COLUMNS} FROM offers o
              WHERE o.is_active = 1 AND o.detail_fetched = 0
              ORDER BY o.first_seen_at, o.offer_id
              LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(limit.map(i64::from).unwrap_or(-1))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(offer_from_row).collect()
    }

    /// Replace the offer's skills and languages and mark its detail as fetched, atomically.
    pub async fn record_detail(&self, offer_id: &str, detail: &OfferDetail) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query("UPDATE offers SET detail_fetched = 1 WHERE offer_id = ?")
            .bind(offer_id)
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(StorageError::OfferNotFound(offer_id.to_string()));
        }

        sqlx::query("DELETE FROM offer_skills WHERE offer_id = ?")
            .bind(offer_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM offer_languages WHERE offer_id = ?")
            .bind(offer_id)
            .execute(&mut *tx)
            .await?;

        for (position, skill) in detail.skills.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO offer_skills (offer_id, position, category, name, level, icon, description)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(offer_id)
            .bind(position as i64)
            .bind(skill.category.as_str())
            .bind(&skill.name)
            .bind(skill.level)
            .bind(&skill.icon)
            .bind(&skill.description)
            .execute(&mut *tx)
            .await?;
        }

        for (position, language) in detail.languages.iter().enumerate() {
            sqlx::query("INSERT INTO offer_languages (offer_id, position, name, level) VALUES (?, ?, ?, ?)")
                .bind(offer_id)
                .bind(position as i64)
                .bind(&language.name)
                .bind(&language.level)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_offer(&self, offer_id: &str) -> Result<Option<Offer>, StorageError> {
        let sql = format!("SELECT {OFFER_COLUMNS} FROM offers o WHERE o.offer_id = ?");
        let row = sqlx::query(&sql).bind(offer_id).fetch_optional(&self.pool).await?;
        row.as_ref().map(offer_from_row).transpose()
    }

    /// Stored requirements for one offer, skills ordered must → nice → extra.
    pub async fn skills_for_offer(&self, offer_id: &str) -> Result<OfferDetail, StorageError> {
        let skill_rows = sqlx::query(
            r#"
            SELECT category, name, level, icon, description
              FROM offer_skills
             WHERE offer_id = ?
             ORDER BY CASE category WHEN 'must' THEN 0 WHEN 'nice' THEN 1 ELSE 2 END, position
            "#,
        )
        .bind(offer_id)
        .fetch_all(&self.pool)
        .await?;

        let skills = skill_rows
            .iter()
            .map(|row| {
                let category: String = row.try_get("category")?;
                Ok(Skill {
                    category: parse_label(&category)?,
                    name: row.try_get("name")?,
                    level: row.try_get("level")?,
                    icon: row.try_get("icon")?,
                    description: row.try_get("description")?,
                })
            })
            .collect::<Result<Vec<_>, StorageError>>()?;

        let languages = sqlx::query("SELECT name, level FROM offer_languages WHERE offer_id = ? ORDER BY position")
            .bind(offer_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|row| {
                Ok(Language {
                    name: row.try_get("name")?,
                    level: row.try_get("level")?,
                })
            })
            .collect::<Result<Vec<_>, StorageError>>()?;

        Ok(OfferDetail { skills, languages })
    }
}

#[cfg(test)]
pub(crate) fn sample_summary(offer_id: &str) -> OfferSummary {
    OfferSummary {
        offer_id: offer_id.to_string(),
        slug: format!("offer-{offer_id}"),
        title: format!("Backend Engineer {offer_id}"),
        company: "Acme".to_string(),
        company_logo_url: None,
        salary_from: Some(40_000),
        salary_to: Some(55_000),
        remote_percentage: Some(100),
        location: Some("Madrid".to_string()),
        raw: serde_json::json!({ "id": offer_id }),
    }
}
