mod commits;
mod identity;
mod sync_state;
mod usage;

pub use identity::UnmappedSummary;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::{
    convert::TryFrom,
    path::Path,
    sync::Arc,
    time::Duration,
};

const SCHEMA: &[(&str, &str)] = &[
    (
        "sync_state",
        r#"
        CREATE TABLE IF NOT EXISTS sync_state (
            provider TEXT PRIMARY KEY,
            last_forward_cursor TEXT,
            oldest_backfilled_date TEXT,
            backfill_complete INTEGER NOT NULL DEFAULT 0,
            version INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        );
        "#,
    ),
    (
        "usage_buckets",
        r#"
        CREATE TABLE IF NOT EXISTS usage_buckets (
            provider TEXT NOT NULL,
            tool TEXT NOT NULL,
            source_key TEXT NOT NULL,
            bucket_start TEXT NOT NULL,
            raw_model TEXT NOT NULL,
            event_key TEXT NOT NULL DEFAULT '',
            bucket_date TEXT NOT NULL,
            identity TEXT NOT NULL,
            normalized_model TEXT NOT NULL,
            model_variant TEXT,
            input_tokens INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            cache_write_tokens INTEGER NOT NULL DEFAULT 0,
            cache_read_tokens INTEGER NOT NULL DEFAULT 0,
            estimated_cost REAL NOT NULL DEFAULT 0.0,
            synced_at TEXT NOT NULL,
            PRIMARY KEY (tool, source_key, bucket_start, raw_model, event_key)
        );
        "#,
    ),
    (
        "usage_buckets date index",
        r#"
        CREATE INDEX IF NOT EXISTS idx_usage_buckets_tool_date
        ON usage_buckets(tool, bucket_date);
        "#,
    ),
    (
        "usage_buckets source index",
        r#"
        CREATE INDEX IF NOT EXISTS idx_usage_buckets_provider_source
        ON usage_buckets(provider, source_key);
        "#,
    ),
    (
        "usage_records",
        r#"
        CREATE TABLE IF NOT EXISTS usage_records (
            date TEXT NOT NULL,
            identity TEXT NOT NULL,
            tool TEXT NOT NULL,
            raw_model TEXT NOT NULL,
            normalized_model TEXT NOT NULL,
            model_variant TEXT,
            input_tokens INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            cache_write_tokens INTEGER NOT NULL DEFAULT 0,
            cache_read_tokens INTEGER NOT NULL DEFAULT 0,
            estimated_cost REAL NOT NULL DEFAULT 0.0,
            PRIMARY KEY (date, identity, tool, raw_model)
        );
        "#,
    ),
    (
        "repositories",
        r#"
        CREATE TABLE IF NOT EXISTS repositories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source TEXT NOT NULL,
            full_name TEXT NOT NULL,
            UNIQUE (source, full_name)
        );
        "#,
    ),
    (
        "commits",
        r#"
        CREATE TABLE IF NOT EXISTS commits (
            repo_id INTEGER NOT NULL REFERENCES repositories(id),
            commit_id TEXT NOT NULL,
            author_email TEXT NOT NULL,
            author_id TEXT,
            committed_at TEXT NOT NULL,
            message TEXT NOT NULL,
            ai_tool TEXT,
            ai_model TEXT,
            additions INTEGER,
            deletions INTEGER,
            PRIMARY KEY (repo_id, commit_id)
        );
        "#,
    ),
    (
        "commits author index",
        r#"
        CREATE INDEX IF NOT EXISTS idx_commits_author_id
        ON commits(author_id);
        "#,
    ),
    (
        "identity_mappings",
        r#"
        CREATE TABLE IF NOT EXISTS identity_mappings (
            provider TEXT NOT NULL,
            external_id TEXT NOT NULL,
            resolved_email TEXT,
            record_count INTEGER NOT NULL DEFAULT 0,
            first_seen_at TEXT NOT NULL,
            last_seen_at TEXT NOT NULL,
            PRIMARY KEY (provider, external_id)
        );
        "#,
    ),
    (
        "webhook_deliveries",
        r#"
        CREATE TABLE IF NOT EXISTS webhook_deliveries (
            delivery_id TEXT PRIMARY KEY,
            event TEXT NOT NULL,
            received_at TEXT NOT NULL,
            commits_processed INTEGER NOT NULL DEFAULT 0
        );
        "#,
    ),
];

#[derive(Clone)]
pub struct Storage {
    pool: Arc<SqlitePool>,
}

impl Storage {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| "failed to connect to sqlite database")?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        for (name, sql) in SCHEMA {
            sqlx::query(sql)
                .execute(&*self.pool)
                .await
                .with_context(|| format!("failed to ensure {name} schema"))?;
        }
        Ok(())
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn parse_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("invalid date stored in DB: {value}"))
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .with_context(|| format!("invalid timestamp stored in DB: {value}"))
}

#[cfg(test)]
pub(crate) async fn test_storage() -> (Storage, tempfile::NamedTempFile) {
    let db_file = tempfile::NamedTempFile::new().unwrap();
    let storage = Storage::connect(db_file.path()).await.unwrap();
    storage.ensure_schema().await.unwrap();
    (storage, db_file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_schema_is_idempotent() {
        let (storage, _db) = test_storage().await;
        storage.ensure_schema().await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&*storage.pool)
        .await
        .unwrap();
        let names: Vec<&str> = tables.iter().map(|(name,)| name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "commits",
                "identity_mappings",
                "repositories",
                "sync_state",
                "usage_buckets",
                "usage_records",
                "webhook_deliveries",
            ]
        );
    }
}
