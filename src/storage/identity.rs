use super::{Storage, parse_timestamp, to_u64};
use crate::model::IdentityMapping;
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sqlx::{Row, sqlite::SqliteRow};

/// "N records from M unmapped keys" for one provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnmappedSummary {
    pub unmapped_keys: u64,
    pub unmapped_records: u64,
}

impl Storage {
    /// Creates the mapping row on first sight and touches `last_seen_at`
    /// otherwise. Returns the resolved email, if any.
    pub async fn touch_identity(
        &self,
        provider: &str,
        external_id: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let seen_at = seen_at.to_rfc3339_opts(SecondsFormat::Secs, true);
        let resolved: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO identity_mappings (provider, external_id, record_count, first_seen_at, last_seen_at)
            VALUES (?, ?, 0, ?, ?)
            ON CONFLICT(provider, external_id) DO UPDATE SET
                last_seen_at = MAX(identity_mappings.last_seen_at, excluded.last_seen_at)
            RETURNING resolved_email;
            "#,
        )
        .bind(provider)
        .bind(external_id)
        .bind(&seen_at)
        .bind(&seen_at)
        .fetch_one(&*self.pool)
        .await
        .with_context(|| format!("failed to record identity {provider}/{external_id}"))?;
        Ok(resolved)
    }

    /// Assigns an email to an unmapped row. Rows that already carry an email
    /// are left alone; returns whether a row changed.
    pub async fn set_resolved_email(
        &self,
        provider: &str,
        external_id: &str,
        email: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE identity_mappings
            SET resolved_email = ?
            WHERE provider = ? AND external_id = ? AND resolved_email IS NULL
            "#,
        )
        .bind(email)
        .bind(provider)
        .bind(external_id)
        .execute(&*self.pool)
        .await
        .with_context(|| format!("failed to map identity {provider}/{external_id}"))?;
        Ok(result.rows_affected() > 0)
    }

    /// Recounts usage rows attributed to each of the provider's keys.
    pub async fn refresh_usage_record_counts(&self, provider: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE identity_mappings
            SET record_count = (
                SELECT COUNT(*) FROM usage_buckets b
                WHERE b.provider = identity_mappings.provider
                  AND b.source_key = identity_mappings.external_id
            )
            WHERE provider = ?
            "#,
        )
        .bind(provider)
        .execute(&*self.pool)
        .await
        .with_context(|| format!("failed to refresh usage counts for {provider}"))?;
        Ok(())
    }

    /// Recounts commits attributed to each of the provider's VCS user ids.
    pub async fn refresh_commit_record_counts(&self, provider: &str, source: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE identity_mappings
            SET record_count = (
                SELECT COUNT(*) FROM commits c
                JOIN repositories r ON r.id = c.repo_id
                WHERE r.source = ? AND c.author_id = identity_mappings.external_id
            )
            WHERE provider = ?
            "#,
        )
        .bind(source)
        .bind(provider)
        .execute(&*self.pool)
        .await
        .with_context(|| format!("failed to refresh commit counts for {provider}"))?;
        Ok(())
    }

    pub async fn unmapped_identities(&self, provider: &str) -> Result<Vec<IdentityMapping>> {
        let rows = sqlx::query(
            r#"
            SELECT provider, external_id, resolved_email, record_count, first_seen_at, last_seen_at
            FROM identity_mappings
            WHERE provider = ? AND resolved_email IS NULL
            ORDER BY record_count DESC, external_id
            "#,
        )
        .bind(provider)
        .fetch_all(&*self.pool)
        .await
        .with_context(|| format!("failed to load unmapped identities for {provider}"))?;

        rows.iter().map(mapping_from_row).collect()
    }

    pub async fn unmapped_summary(&self, provider: &str) -> Result<UnmappedSummary> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS unmapped_keys, COALESCE(SUM(record_count), 0) AS unmapped_records
            FROM identity_mappings
            WHERE provider = ? AND resolved_email IS NULL
            "#,
        )
        .bind(provider)
        .fetch_one(&*self.pool)
        .await
        .with_context(|| format!("failed to summarize unmapped identities for {provider}"))?;

        Ok(UnmappedSummary {
            unmapped_keys: to_u64(row.try_get::<i64, _>("unmapped_keys").unwrap_or(0)),
            unmapped_records: to_u64(row.try_get::<i64, _>("unmapped_records").unwrap_or(0)),
        })
    }
}

#[cfg(test)]
impl Storage {
    pub async fn identity_mappings(&self, provider: &str) -> Result<Vec<IdentityMapping>> {
        let rows = sqlx::query(
            r#"
            SELECT provider, external_id, resolved_email, record_count, first_seen_at, last_seen_at
            FROM identity_mappings
            WHERE provider = ?
            ORDER BY external_id
            "#,
        )
        .bind(provider)
        .fetch_all(&*self.pool)
        .await
        .with_context(|| format!("failed to load identity mappings for {provider}"))?;

        rows.iter().map(mapping_from_row).collect()
    }
}

fn mapping_from_row(row: &SqliteRow) -> Result<IdentityMapping> {
    let first_seen_at: String = row.try_get("first_seen_at")?;
    let last_seen_at: String = row.try_get("last_seen_at")?;
    Ok(IdentityMapping {
        provider: row.try_get("provider")?,
        external_id: row.try_get("external_id")?,
        resolved_email: row.try_get("resolved_email")?,
        record_count: to_u64(row.try_get::<i64, _>("record_count").unwrap_or(0)),
        first_seen_at: parse_timestamp(&first_seen_at)?,
        last_seen_at: parse_timestamp(&last_seen_at)?,
    })
}
