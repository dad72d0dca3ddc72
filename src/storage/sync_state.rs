use super::{Storage, parse_date};
use crate::model::{ForwardCursor, SyncState};
use anyhow::{Context, Result};
use chrono::{NaiveDate, SecondsFormat, Utc};
use sqlx::{Row, sqlite::SqliteRow};

impl Storage {
    pub async fn load_sync_state(&self, provider: &str) -> Result<Option<SyncState>> {
        let row = sqlx::query(
            r#"
            SELECT provider, last_forward_cursor, oldest_backfilled_date, backfill_complete, version
            FROM sync_state
            WHERE provider = ?
            "#,
        )
        .bind(provider)
        .fetch_optional(&*self.pool)
        .await
        .with_context(|| format!("failed to load sync state for {provider}"))?;

        row.map(|row| sync_state_from_row(&row)).transpose()
    }

    /// Returns the provider's state, creating an empty row on first use.
    pub async fn load_or_create_sync_state(&self, provider: &str) -> Result<SyncState> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (provider, backfill_complete, version, updated_at)
            VALUES (?, 0, 0, ?)
            ON CONFLICT(provider) DO NOTHING;
            "#,
        )
        .bind(provider)
        .bind(now_string())
        .execute(&*self.pool)
        .await
        .with_context(|| format!("failed to create sync state for {provider}"))?;

        self.load_sync_state(provider)
            .await?
            .with_context(|| format!("sync state for {provider} vanished after insert"))
    }

    pub async fn list_sync_states(&self) -> Result<Vec<SyncState>> {
        let rows = sqlx::query(
            r#"
            SELECT provider, last_forward_cursor, oldest_backfilled_date, backfill_complete, version
            FROM sync_state
            ORDER BY provider
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .with_context(|| "failed to list sync states")?;

        rows.iter().map(sync_state_from_row).collect()
    }

    /// Moves the forward cursor if the row still carries `state.version`.
    /// Returns the new state, or `None` when another writer got there first.
    pub async fn commit_forward_cursor(
        &self,
        state: &SyncState,
        cursor: ForwardCursor,
    ) -> Result<Option<SyncState>> {
        let result = sqlx::query(
            r#"
            UPDATE sync_state
            SET last_forward_cursor = ?, version = version + 1, updated_at = ?
            WHERE provider = ? AND version = ?
            "#,
        )
        .bind(cursor.to_storage_string())
        .bind(now_string())
        .bind(&state.provider)
        .bind(state.version)
        .execute(&*self.pool)
        .await
        .with_context(|| format!("failed to advance forward cursor for {}", state.provider))?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(SyncState {
            last_forward_cursor: Some(cursor),
            version: state.version + 1,
            ..state.clone()
        }))
    }

    /// Records backfill progress with the same compare-and-set guard. The
    /// oldest date never moves forward and completion is never cleared.
    pub async fn record_backfill_progress(
        &self,
        state: &SyncState,
        oldest: Option<NaiveDate>,
        complete: bool,
    ) -> Result<Option<SyncState>> {
        let oldest = match (state.oldest_backfilled_date, oldest) {
            (Some(current), Some(new)) => Some(current.min(new)),
            (current, new) => current.or(new),
        };
        let complete = state.backfill_complete || complete;

        let result = sqlx::query(
            r#"
            UPDATE sync_state
            SET oldest_backfilled_date = ?, backfill_complete = ?, version = version + 1, updated_at = ?
            WHERE provider = ? AND version = ?
            "#,
        )
        .bind(oldest.map(|date| date.to_string()))
        .bind(complete)
        .bind(now_string())
        .bind(&state.provider)
        .bind(state.version)
        .execute(&*self.pool)
        .await
        .with_context(|| format!("failed to record backfill progress for {}", state.provider))?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(SyncState {
            oldest_backfilled_date: oldest,
            backfill_complete: complete,
            version: state.version + 1,
            ..state.clone()
        }))
    }
}

fn sync_state_from_row(row: &SqliteRow) -> Result<SyncState> {
    let cursor: Option<String> = row.try_get("last_forward_cursor")?;
    let last_forward_cursor = match cursor {
        Some(value) => Some(
            ForwardCursor::parse(&value)
                .with_context(|| format!("invalid forward cursor stored in DB: {value}"))?,
        ),
        None => None,
    };
    let oldest: Option<String> = row.try_get("oldest_backfilled_date")?;
    Ok(SyncState {
        provider: row.try_get("provider")?,
        last_forward_cursor,
        oldest_backfilled_date: oldest.as_deref().map(parse_date).transpose()?,
        backfill_complete: row.try_get::<bool, _>("backfill_complete").unwrap_or(false),
        version: row.try_get::<i64, _>("version").unwrap_or(0),
    })
}

fn now_string() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}
