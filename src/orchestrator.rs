//! Forward sync and backfill over any [`SyncProvider`].
//!
//! Every run is a function from the persisted [`SyncState`] plus one batch of
//! provider data to a new persisted state. State only moves over windows that
//! were written completely, so an interrupted run is simply redone by the next
//! invocation; natural-key upserts make the redo free of duplicates.

use crate::{
    config::SyncConfig,
    error::{ErrorList, FetchError},
    model::{
        BackfillResult, BackfillStatus, ForwardCursor, ForwardSyncResult, SyncState,
        SyncedRange, WriteStats, start_of_day,
    },
    providers::{Cadence, SyncProvider, SyncWindow},
    storage::{Storage, UnmappedSummary},
};
use anyhow::Result;
use chrono::{DateTime, Duration, DurationRound, NaiveDate, SecondsFormat, Utc};
use serde::Serialize;
use std::fmt;
use tracing::{debug, info, warn};

/// Attempts at a compare-and-set before reporting a conflict.
const STATE_WRITE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_errors: usize,
    pub backfill_batch_days: u32,
    pub initial_lookback_days: u32,
    pub initial_lookback_hours: u32,
}

impl From<&SyncConfig> for OrchestratorSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            max_errors: config.max_errors,
            backfill_batch_days: config.backfill_batch_days.max(1),
            initial_lookback_days: config.initial_lookback_days.max(1),
            initial_lookback_hours: config.initial_lookback_hours.max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    pub provider: String,
    pub configured: bool,
    pub state: SyncState,
    pub unmapped: UnmappedSummary,
}

/// Window a forward sync should cover and where the cursor lands after it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ForwardPlan {
    window: SyncWindow,
    range: SyncedRange,
    next_cursor: ForwardCursor,
}

enum DrainError {
    Fetch(FetchError),
    Store(anyhow::Error),
}

impl fmt::Display for DrainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DrainError::Fetch(err) => write!(f, "{err}"),
            DrainError::Store(err) => write!(f, "failed to store page: {err:#}"),
        }
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    storage: Storage,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(storage: Storage, settings: OrchestratorSettings) -> Self {
        Self { storage, settings }
    }

    pub async fn run_forward_sync<P: SyncProvider>(
        &self,
        provider: &P,
    ) -> Result<ForwardSyncResult> {
        self.run_forward_sync_at(provider, Utc::now()).await
    }

    pub async fn run_forward_sync_at<P: SyncProvider>(
        &self,
        provider: &P,
        now: DateTime<Utc>,
    ) -> Result<ForwardSyncResult> {
        let name = provider.name();
        let mut result = ForwardSyncResult {
            provider: name.to_string(),
            success: true,
            skipped: false,
            rate_limited: false,
            retry_after_secs: None,
            synced_range: None,
            records_imported: 0,
            records_skipped: 0,
            errors: Vec::new(),
        };
        if !provider.is_configured() {
            info!(provider = name, "provider not configured, skipping forward sync");
            result.skipped = true;
            return Ok(result);
        }

        let state = self.storage.load_or_create_sync_state(name).await?;
        let Some(plan) = self.plan_forward(provider.cadence(), &state, now) else {
            debug!(provider = name, "forward sync already caught up");
            return Ok(result);
        };

        info!(
            provider = name,
            window_start = %plan.window.start,
            window_end = %plan.window.end,
            "starting forward sync"
        );
        let mut stats = WriteStats::default();
        let mut errors = ErrorList::new(self.settings.max_errors);
        match drain_window(provider, &plan.window, &mut stats).await {
            Ok(_) => {
                if self.commit_forward(&state, plan.next_cursor).await? {
                    result.synced_range = Some(plan.range);
                } else {
                    errors.push("sync state changed concurrently; cursor not advanced");
                }
            }
            Err(DrainError::Fetch(FetchError::NotConfigured)) => result.skipped = true,
            Err(err) => {
                if let DrainError::Fetch(fetch) = &err {
                    result.rate_limited = fetch.is_rate_limited();
                    result.retry_after_secs = fetch.retry_after();
                }
                warn!(
                    provider = name,
                    error = %err,
                    retry_after_secs = ?result.retry_after_secs,
                    "forward sync stopped early"
                );
                errors.push(err.to_string());
            }
        }

        result.records_imported = stats.imported;
        result.records_skipped = stats.skipped;
        result.success = errors.is_empty();
        result.errors = errors.into_vec();
        info!(
            provider = name,
            imported = result.records_imported,
            skipped = result.records_skipped,
            did_sync = result.did_sync(),
            rate_limited = result.rate_limited,
            "forward sync finished"
        );
        Ok(result)
    }

    pub async fn run_backfill<P: SyncProvider>(
        &self,
        provider: &P,
        target: NaiveDate,
    ) -> Result<BackfillResult> {
        self.run_backfill_at(provider, target, Utc::now()).await
    }

    pub async fn run_backfill_at<P: SyncProvider>(
        &self,
        provider: &P,
        target: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<BackfillResult> {
        let name = provider.name();
        let mut result = BackfillResult {
            provider: name.to_string(),
            success: true,
            skipped: false,
            rate_limited: false,
            retry_after_secs: None,
            status: BackfillStatus::InProgress,
            records_imported: 0,
            records_skipped: 0,
            errors: Vec::new(),
            last_processed_date: None,
        };
        if !provider.is_configured() {
            info!(provider = name, "provider not configured, skipping backfill");
            result.skipped = true;
            return Ok(result);
        }

        let mut state = self.storage.load_or_create_sync_state(name).await?;
        let oldest = state.oldest_backfilled_date.unwrap_or(now.date_naive());
        if state.backfill_complete || oldest <= target {
            result.status = BackfillStatus::Complete;
            result.last_processed_date = state.oldest_backfilled_date;
            return Ok(result);
        }

        let batch_floor = oldest
            .checked_sub_signed(Duration::days(i64::from(self.settings.backfill_batch_days)))
            .unwrap_or(target)
            .max(target);
        info!(provider = name, %oldest, %target, %batch_floor, "starting backfill batch");

        let mut stats = WriteStats::default();
        let mut errors = ErrorList::new(self.settings.max_errors);
        let mut day = oldest.pred_opt();

        while let Some(current) = day.filter(|day| *day >= batch_floor) {
            let window = SyncWindow::new(
                start_of_day(current),
                start_of_day(current + Duration::days(1)),
            );
            let drained = drain_window(provider, &window, &mut stats).await;

            let (oldest_committed, exhausted) = match drained {
                Ok(0) => match provider.history_exhausted(current).await {
                    Ok(exhausted) => (Some(current), exhausted),
                    Err(err) => {
                        result.rate_limited = err.is_rate_limited();
                        result.retry_after_secs = err.retry_after();
                        warn!(
                            provider = name,
                            day = %current,
                            error = %err,
                            "history probe failed"
                        );
                        errors.push(err.to_string());
                        // The day itself was fully fetched.
                        self.commit_backfill(&mut state, Some(current), false, &mut errors)
                            .await?;
                        break;
                    }
                },
                Ok(_) => (Some(current), false),
                Err(DrainError::Fetch(FetchError::HistoryExhausted)) => (None, true),
                Err(err) => {
                    if let DrainError::Fetch(fetch) = &err {
                        result.rate_limited = fetch.is_rate_limited();
                        result.retry_after_secs = fetch.retry_after();
                    }
                    warn!(provider = name, day = %current, error = %err, "backfill stopped early");
                    errors.push(err.to_string());
                    break;
                }
            };

            if !self
                .commit_backfill(&mut state, oldest_committed, exhausted, &mut errors)
                .await?
            {
                break;
            }
            debug!(provider = name, day = %current, exhausted, "backfill day committed");
            if exhausted {
                info!(provider = name, day = %current, "provider has no older history");
                break;
            }
            day = current.pred_opt();
        }

        result.records_imported = stats.imported;
        result.records_skipped = stats.skipped;
        result.last_processed_date = state.oldest_backfilled_date;
        result.status = if result.rate_limited {
            BackfillStatus::RateLimited
        } else if state.backfill_complete
            || state.oldest_backfilled_date.is_some_and(|oldest| oldest <= target)
        {
            BackfillStatus::Complete
        } else {
            BackfillStatus::InProgress
        };
        result.success = errors.is_empty();
        result.errors = errors.into_vec();
        info!(
            provider = name,
            imported = result.records_imported,
            status = ?result.status,
            last_processed_date = ?result.last_processed_date,
            "backfill batch finished"
        );
        Ok(result)
    }

    /// Sync state and unmapped-identity accounting, read concurrently.
    pub async fn provider_status(
        &self,
        provider: &str,
        configured: bool,
    ) -> Result<ProviderStatus> {
        let (state, unmapped) = tokio::try_join!(
            self.storage.load_sync_state(provider),
            self.storage.unmapped_summary(provider)
        )?;
        Ok(ProviderStatus {
            provider: provider.to_string(),
            configured,
            state: state.unwrap_or_else(|| SyncState::new(provider)),
            unmapped,
        })
    }

    fn plan_forward(
        &self,
        cadence: Cadence,
        state: &SyncState,
        now: DateTime<Utc>,
    ) -> Option<ForwardPlan> {
        match cadence {
            Cadence::Daily => {
                let yesterday = now.date_naive().pred_opt()?;
                let start = match state.last_forward_cursor {
                    Some(cursor) if cursor.as_date() >= yesterday => return None,
                    // Re-cover the last synced day; it may have been partial.
                    Some(cursor) => cursor.as_date().pred_opt()?,
                    None => yesterday.checked_sub_signed(Duration::days(
                        i64::from(self.settings.initial_lookback_days) - 1,
                    ))?,
                };
                Some(ForwardPlan {
                    window: SyncWindow::new(
                        start_of_day(start),
                        start_of_day(yesterday.succ_opt()?),
                    ),
                    range: SyncedRange {
                        start: start.to_string(),
                        end: yesterday.to_string(),
                    },
                    next_cursor: ForwardCursor::Date(yesterday),
                })
            }
            Cadence::Hourly => {
                let boundary = last_complete_hour(now)?;
                let start = match state.last_forward_cursor {
                    Some(cursor) if cursor.as_hour() >= boundary => return None,
                    Some(cursor) => cursor.as_hour(),
                    None => {
                        boundary
                            - Duration::hours(i64::from(self.settings.initial_lookback_hours))
                    }
                };
                Some(ForwardPlan {
                    window: SyncWindow::new(start, boundary),
                    range: SyncedRange {
                        start: start.to_rfc3339_opts(SecondsFormat::Secs, true),
                        end: boundary.to_rfc3339_opts(SecondsFormat::Secs, true),
                    },
                    next_cursor: ForwardCursor::Hour(boundary),
                })
            }
        }
    }

    /// Advances the forward cursor. A concurrent write that left the cursor
    /// itself untouched (backfill progress) is retried; a moved cursor is a
    /// conflict and returns `false`.
    async fn commit_forward(&self, read: &SyncState, cursor: ForwardCursor) -> Result<bool> {
        let mut current = read.clone();
        for _ in 0..STATE_WRITE_ATTEMPTS {
            if self.storage.commit_forward_cursor(&current, cursor).await?.is_some() {
                return Ok(true);
            }
            match self.storage.load_sync_state(&read.provider).await? {
                Some(fresh) if fresh.last_forward_cursor == read.last_forward_cursor => {
                    current = fresh
                }
                _ => return Ok(false),
            }
        }
        Ok(false)
    }

    /// Records backfill progress, re-reading the row when another writer got
    /// in between. Progress merges monotonically, so the retry is safe.
    async fn commit_backfill(
        &self,
        state: &mut SyncState,
        oldest: Option<NaiveDate>,
        complete: bool,
        errors: &mut ErrorList,
    ) -> Result<bool> {
        for _ in 0..STATE_WRITE_ATTEMPTS {
            if let Some(updated) = self
                .storage
                .record_backfill_progress(state, oldest, complete)
                .await?
            {
                *state = updated;
                return Ok(true);
            }
            *state = self.storage.load_or_create_sync_state(&state.provider).await?;
        }
        errors.push("sync state changed concurrently; backfill progress not recorded");
        Ok(false)
    }
}

/// Fetches and stores every page of `window`. Returns how many records the
/// provider returned; `stats` keeps what was written even on failure.
async fn drain_window<P: SyncProvider>(
    provider: &P,
    window: &SyncWindow,
    stats: &mut WriteStats,
) -> Result<u64, DrainError> {
    let mut cursor: Option<String> = None;
    let mut seen = 0u64;
    loop {
        let page = provider
            .fetch_page(window, cursor.as_deref())
            .await
            .map_err(DrainError::Fetch)?;
        seen += page.records.len() as u64;
        if !page.records.is_empty() {
            *stats += provider
                .store_page(page.records)
                .await
                .map_err(DrainError::Store)?;
        }
        match page.next_cursor {
            Some(next) if cursor.as_deref() == Some(next.as_str()) => {
                return Err(DrainError::Fetch(FetchError::Decode(format!(
                    "provider repeated page cursor {next}"
                ))));
            }
            Some(next) => cursor = Some(next),
            None => return Ok(seen),
        }
    }
}

/// Most recent hour boundary strictly before `now`.
fn last_complete_hour(now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let floor = now.duration_trunc(Duration::hours(1)).ok()?;
    if floor == now {
        Some(floor - Duration::hours(1))
    } else {
        Some(floor)
    }
}
