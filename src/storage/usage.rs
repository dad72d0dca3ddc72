use super::{Storage, parse_date, to_i64, to_u64};
use crate::model::{TokenCounts, UsageBucket, UsageRecord, WriteStats};
use anyhow::{Context, Result};
use chrono::{NaiveDate, SecondsFormat, Utc};
use sqlx::Row;
use std::collections::BTreeSet;

impl Storage {
    /// Upserts provider-level usage rows and recomputes the daily usage
    /// records of every touched `(tool, date)` in one transaction. A row counts
    /// as imported only when it is new or one of its values changed.
    pub async fn upsert_usage_buckets(&self, buckets: &[UsageBucket]) -> Result<WriteStats> {
        let mut stats = WriteStats::default();
        if buckets.is_empty() {
            return Ok(stats);
        }

        let synced_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut touched = BTreeSet::new();
        let mut tx = self
            .pool
            .begin()
            .await
            .with_context(|| "failed to start usage transaction")?;

        for bucket in buckets {
            let result = sqlx::query(
                r#"
                INSERT INTO usage_buckets (
                    provider, tool, source_key, bucket_start, raw_model, event_key, bucket_date,
                    identity, normalized_model, model_variant, input_tokens, output_tokens,
                    cache_write_tokens, cache_read_tokens, estimated_cost, synced_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(tool, source_key, bucket_start, raw_model, event_key) DO UPDATE SET
                    normalized_model = excluded.normalized_model,
                    model_variant = excluded.model_variant,
                    input_tokens = excluded.input_tokens,
                    output_tokens = excluded.output_tokens,
                    cache_write_tokens = excluded.cache_write_tokens,
                    cache_read_tokens = excluded.cache_read_tokens,
                    estimated_cost = excluded.estimated_cost,
                    synced_at = excluded.synced_at
                WHERE usage_buckets.input_tokens != excluded.input_tokens
                   OR usage_buckets.output_tokens != excluded.output_tokens
                   OR usage_buckets.cache_write_tokens != excluded.cache_write_tokens
                   OR usage_buckets.cache_read_tokens != excluded.cache_read_tokens
                   OR usage_buckets.estimated_cost != excluded.estimated_cost
                   OR usage_buckets.normalized_model != excluded.normalized_model
                   OR usage_buckets.model_variant IS NOT excluded.model_variant;
                "#,
            )
            .bind(&bucket.provider)
            .bind(&bucket.tool)
            .bind(&bucket.source_key)
            .bind(&bucket.bucket_start)
            .bind(&bucket.raw_model)
            .bind(&bucket.event_key)
            .bind(bucket.date.to_string())
            .bind(&bucket.identity)
            .bind(&bucket.normalized_model)
            .bind(bucket.model_variant.as_deref())
            .bind(to_i64(bucket.tokens.input_tokens))
            .bind(to_i64(bucket.tokens.output_tokens))
            .bind(to_i64(bucket.tokens.cache_write_tokens))
            .bind(to_i64(bucket.tokens.cache_read_tokens))
            .bind(bucket.estimated_cost)
            .bind(&synced_at)
            .execute(&mut *tx)
            .await
            .with_context(|| "failed to upsert usage bucket")?;

            if result.rows_affected() > 0 {
                stats.imported += 1;
                touched.insert((bucket.tool.clone(), bucket.date));
            } else {
                stats.skipped += 1;
            }
        }

        for (tool, date) in &touched {
            sqlx::query("DELETE FROM usage_records WHERE tool = ? AND date = ?")
                .bind(tool)
                .bind(date.to_string())
                .execute(&mut *tx)
                .await
                .with_context(|| "failed to clear daily usage records")?;

            sqlx::query(
                r#"
                INSERT INTO usage_records (
                    date, identity, tool, raw_model, normalized_model, model_variant,
                    input_tokens, output_tokens, cache_write_tokens, cache_read_tokens, estimated_cost
                )
                SELECT bucket_date, identity, tool, raw_model,
                       MAX(normalized_model), MAX(model_variant),
                       SUM(input_tokens), SUM(output_tokens),
                       SUM(cache_write_tokens), SUM(cache_read_tokens),
                       SUM(estimated_cost)
                FROM usage_buckets
                WHERE tool = ? AND bucket_date = ?
                GROUP BY bucket_date, identity, tool, raw_model;
                "#,
            )
            .bind(tool)
            .bind(date.to_string())
            .execute(&mut *tx)
            .await
            .with_context(|| "failed to roll up daily usage records")?;
        }

        tx.commit()
            .await
            .with_context(|| "failed to commit usage transaction")?;
        Ok(stats)
    }

    /// Daily records for `tool` with `start <= date <= end`.
    pub async fn usage_records_between(
        &self,
        tool: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<UsageRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT date, identity, tool, raw_model, normalized_model, model_variant,
                   input_tokens, output_tokens, cache_write_tokens, cache_read_tokens, estimated_cost
            FROM usage_records
            WHERE tool = ? AND date BETWEEN ? AND ?
            ORDER BY date, identity, raw_model
            "#,
        )
        .bind(tool)
        .bind(start.to_string())
        .bind(end.to_string())
        .fetch_all(&*self.pool)
        .await
        .with_context(|| "failed to load usage records")?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let date: String = row.try_get("date")?;
            records.push(UsageRecord {
                date: parse_date(&date)?,
                identity: row.try_get("identity")?,
                tool: row.try_get("tool")?,
                raw_model: row.try_get("raw_model")?,
                normalized_model: row.try_get("normalized_model")?,
                model_variant: row.try_get("model_variant")?,
                tokens: TokenCounts {
                    input_tokens: to_u64(row.try_get::<i64, _>("input_tokens").unwrap_or(0)),
                    output_tokens: to_u64(row.try_get::<i64, _>("output_tokens").unwrap_or(0)),
                    cache_write_tokens: to_u64(
                        row.try_get::<i64, _>("cache_write_tokens").unwrap_or(0),
                    ),
                    cache_read_tokens: to_u64(
                        row.try_get::<i64, _>("cache_read_tokens").unwrap_or(0),
                    ),
                },
                estimated_cost: row.try_get::<f64, _>("estimated_cost").unwrap_or(0.0),
            });
        }
        Ok(records)
    }
}

#[cfg(test)]
impl Storage {
    pub async fn usage_bucket_count(&self, provider: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM usage_buckets WHERE provider = ?")
            .bind(provider)
            .fetch_one(&*self.pool)
            .await
            .with_context(|| "failed to count usage buckets")?;
        Ok(to_u64(count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_storage;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, d).unwrap()
    }

    fn bucket(source_key: &str, bucket_start: &str, date: NaiveDate, input: u64) -> UsageBucket {
        UsageBucket {
            provider: "hourly_events".to_string(),
            tool: "cursor".to_string(),
            source_key: source_key.to_string(),
            bucket_start: bucket_start.to_string(),
            event_key: String::new(),
            date,
            identity: format!("{source_key}@example.com"),
            raw_model: "claude-4-sonnet-thinking".to_string(),
            normalized_model: "claude-4-sonnet".to_string(),
            model_variant: Some("thinking".to_string()),
            tokens: TokenCounts {
                input_tokens: input,
                output_tokens: 10,
                ..TokenCounts::default()
            },
            estimated_cost: 0.5,
        }
    }

    #[tokio::test]
    async fn reupserting_identical_rows_is_skipped() {
        let (storage, _db) = test_storage().await;
        let rows = vec![
            bucket("alice", "2025-01-02T10:00:00Z", day(2), 100),
            bucket("alice", "2025-01-02T11:00:00Z", day(2), 50),
        ];

        let first = storage.upsert_usage_buckets(&rows).await.unwrap();
        assert_eq!(first, WriteStats { imported: 2, skipped: 0 });

        let second = storage.upsert_usage_buckets(&rows).await.unwrap();
        assert_eq!(second, WriteStats { imported: 0, skipped: 2 });
        assert_eq!(storage.usage_bucket_count("hourly_events").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn daily_records_roll_up_and_correct_on_resync() {
        let (storage, _db) = test_storage().await;
        storage
            .upsert_usage_buckets(&[
                bucket("alice", "2025-01-02T10:00:00Z", day(2), 100),
                bucket("alice", "2025-01-02T11:00:00Z", day(2), 50),
                bucket("bob", "2025-01-02T11:00:00Z", day(2), 7),
            ])
            .await
            .unwrap();

        let records = storage
            .usage_records_between("cursor", day(1), day(3))
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].identity, "alice@example.com");
        assert_eq!(records[0].tokens.input_tokens, 150);
        assert_eq!(records[0].tokens.output_tokens, 20);
        assert!((records[0].estimated_cost - 1.0).abs() < 1e-9);
        assert_eq!(records[0].model_variant.as_deref(), Some("thinking"));

        let stats = storage
            .upsert_usage_buckets(&[bucket("alice", "2025-01-02T11:00:00Z", day(2), 80)])
            .await
            .unwrap();
        assert_eq!(stats.imported, 1);

        let records = storage
            .usage_records_between("cursor", day(2), day(2))
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].tokens.input_tokens, 180);
    }
}
