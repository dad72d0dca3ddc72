use super::{Storage, to_i64};
use crate::model::{NewCommit, Repository, WriteStats};
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};

impl Storage {
    pub async fn upsert_repository(&self, source: &str, full_name: &str) -> Result<Repository> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO repositories (source, full_name)
            VALUES (?, ?)
            ON CONFLICT(source, full_name) DO UPDATE SET full_name = excluded.full_name
            RETURNING id;
            "#,
        )
        .bind(source)
        .bind(full_name)
        .fetch_one(&*self.pool)
        .await
        .with_context(|| format!("failed to upsert repository {source}/{full_name}"))?;

        Ok(Repository {
            id,
            source: source.to_string(),
            full_name: full_name.to_string(),
        })
    }

    /// Upserts commits on `(repo_id, commit_id)`. Diff stats already stored
    /// are kept when a redelivery arrives without them.
    pub async fn upsert_commits(&self, repo_id: i64, commits: &[NewCommit]) -> Result<WriteStats> {
        let mut stats = WriteStats::default();
        if commits.is_empty() {
            return Ok(stats);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .with_context(|| "failed to start commit transaction")?;

        for commit in commits {
            let result = sqlx::query(
                r#"
                INSERT INTO commits (
                    repo_id, commit_id, author_email, author_id, committed_at, message,
                    ai_tool, ai_model, additions, deletions
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(repo_id, commit_id) DO UPDATE SET
                    author_email = excluded.author_email,
                    author_id = COALESCE(excluded.author_id, commits.author_id),
                    committed_at = excluded.committed_at,
                    message = excluded.message,
                    ai_tool = excluded.ai_tool,
                    ai_model = excluded.ai_model,
                    additions = COALESCE(excluded.additions, commits.additions),
                    deletions = COALESCE(excluded.deletions, commits.deletions)
                WHERE commits.author_email != excluded.author_email
                   OR commits.author_id IS NOT COALESCE(excluded.author_id, commits.author_id)
                   OR commits.committed_at != excluded.committed_at
                   OR commits.message != excluded.message
                   OR commits.ai_tool IS NOT excluded.ai_tool
                   OR commits.ai_model IS NOT excluded.ai_model
                   OR commits.additions IS NOT COALESCE(excluded.additions, commits.additions)
                   OR commits.deletions IS NOT COALESCE(excluded.deletions, commits.deletions);
                "#,
            )
            .bind(repo_id)
            .bind(&commit.commit_id)
            .bind(&commit.author_email)
            .bind(commit.author_id.as_deref())
            .bind(format_timestamp(commit.committed_at))
            .bind(&commit.message)
            .bind(commit.ai_tool.as_deref())
            .bind(commit.ai_model.as_deref())
            .bind(commit.additions.map(to_i64))
            .bind(commit.deletions.map(to_i64))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to upsert commit {}", commit.commit_id))?;

            if result.rows_affected() > 0 {
                stats.imported += 1;
            } else {
                stats.skipped += 1;
            }
        }

        tx.commit()
            .await
            .with_context(|| "failed to commit commit transaction")?;
        Ok(stats)
    }

    /// Most frequent non-noreply author email recorded for a VCS user id.
    pub async fn most_frequent_author_email(&self, author_id: &str) -> Result<Option<String>> {
        let email: Option<String> = sqlx::query_scalar(
            r#"
            SELECT author_email
            FROM commits
            WHERE author_id = ? AND author_email != '' AND author_email NOT LIKE '%noreply%'
            GROUP BY author_email
            ORDER BY COUNT(*) DESC, author_email
            LIMIT 1
            "#,
        )
        .bind(author_id)
        .fetch_optional(&*self.pool)
        .await
        .with_context(|| format!("failed to detect author email for {author_id}"))?;
        Ok(email)
    }

    /// Logs a webhook delivery; a redelivery overwrites the earlier entry.
    pub async fn record_webhook_delivery(
        &self,
        delivery_id: &str,
        event: &str,
        received_at: DateTime<Utc>,
        commits_processed: u64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_deliveries (delivery_id, event, received_at, commits_processed)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(delivery_id) DO UPDATE SET
                event = excluded.event,
                received_at = excluded.received_at,
                commits_processed = excluded.commits_processed;
            "#,
        )
        .bind(delivery_id)
        .bind(event)
        .bind(format_timestamp(received_at))
        .bind(to_i64(commits_processed))
        .execute(&*self.pool)
        .await
        .with_context(|| format!("failed to record webhook delivery {delivery_id}"))?;
        Ok(())
    }
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// A stored commit row as read back for inspection.
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub repo_id: i64,
    pub commit_id: String,
    pub author_email: String,
    pub author_id: Option<String>,
    pub committed_at: DateTime<Utc>,
    pub message: String,
    pub ai_tool: Option<String>,
    pub ai_model: Option<String>,
    pub additions: Option<u64>,
    pub deletions: Option<u64>,
}

#[cfg(test)]
impl Storage {
    pub async fn commits_for_repository(&self, repo_id: i64) -> Result<Vec<CommitRecord>> {
        use sqlx::Row;

        let rows = sqlx::query(
            r#"
            SELECT repo_id, commit_id, author_email, author_id, committed_at, message,
                   ai_tool, ai_model, additions, deletions
            FROM commits
            WHERE repo_id = ?
            ORDER BY committed_at DESC, commit_id
            "#,
        )
        .bind(repo_id)
        .fetch_all(&*self.pool)
        .await
        .with_context(|| "failed to load commits")?;

        let mut commits = Vec::with_capacity(rows.len());
        for row in rows {
            let committed_at: String = row.try_get("committed_at")?;
            commits.push(CommitRecord {
                repo_id: row.try_get("repo_id")?,
                commit_id: row.try_get("commit_id")?,
                author_email: row.try_get("author_email")?,
                author_id: row.try_get("author_id")?,
                committed_at: super::parse_timestamp(&committed_at)?,
                message: row.try_get("message")?,
                ai_tool: row.try_get("ai_tool")?,
                ai_model: row.try_get("ai_model")?,
                additions: row.try_get::<Option<i64>, _>("additions")?.map(super::to_u64),
                deletions: row.try_get::<Option<i64>, _>("deletions")?.map(super::to_u64),
            });
        }
        Ok(commits)
    }

    pub async fn commit_exists(&self, repo_id: i64, commit_id: &str) -> Result<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM commits WHERE repo_id = ? AND commit_id = ?")
                .bind(repo_id)
                .bind(commit_id)
                .fetch_optional(&*self.pool)
                .await
                .with_context(|| "failed to look up commit")?;
        Ok(found.is_some())
    }

    pub async fn webhook_delivery_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM webhook_deliveries")
            .fetch_one(&*self.pool)
            .await
            .with_context(|| "failed to count webhook deliveries")?;
        Ok(super::to_u64(count))
    }
}
