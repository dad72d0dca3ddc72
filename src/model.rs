use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::Serialize;
use std::ops::AddAssign;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenCounts {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_write_tokens: u64,
    pub cache_read_tokens: u64,
}

impl TokenCounts {
    pub fn is_zero(&self) -> bool {
        self.input_tokens == 0
            && self.output_tokens == 0
            && self.cache_write_tokens == 0
            && self.cache_read_tokens == 0
    }
}

impl AddAssign for TokenCounts {
    fn add_assign(&mut self, other: Self) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.cache_write_tokens = self
            .cache_write_tokens
            .saturating_add(other.cache_write_tokens);
        self.cache_read_tokens = self.cache_read_tokens.saturating_add(other.cache_read_tokens);
    }
}

/// A provider-level usage row exactly as reported: one daily bucket from the
/// usage-report API or one event from the hourly-events API.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageBucket {
    pub provider: String,
    pub tool: String,
    /// Opaque identifier the provider attributed the usage to.
    pub source_key: String,
    pub bucket_start: String,
    /// Separates distinct events that share a bucket start; empty for daily buckets.
    pub event_key: String,
    pub date: NaiveDate,
    /// Resolved email, or the opaque key when unmapped.
    pub identity: String,
    pub raw_model: String,
    pub normalized_model: String,
    pub model_variant: Option<String>,
    pub tokens: TokenCounts,
    pub estimated_cost: f64,
}

/// Canonical daily usage row, unique on `(date, identity, tool, raw_model)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub date: NaiveDate,
    pub identity: String,
    pub tool: String,
    pub raw_model: String,
    pub normalized_model: String,
    pub model_variant: Option<String>,
    #[serde(flatten)]
    pub tokens: TokenCounts,
    pub estimated_cost: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub id: i64,
    pub source: String,
    pub full_name: String,
}

/// A commit ready to be upserted on `(repo_id, commit_id)`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCommit {
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

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityMapping {
    pub provider: String,
    pub external_id: String,
    pub resolved_email: Option<String>,
    pub record_count: u64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Position of a provider's forward sync. Daily providers track the last
/// synced calendar day, hourly providers the end of the last synced hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ForwardCursor {
    Date(NaiveDate),
    Hour(DateTime<Utc>),
}

impl ForwardCursor {
    pub fn parse(value: &str) -> Option<Self> {
        if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
            return Some(Self::Date(date));
        }
        DateTime::parse_from_rfc3339(value)
            .ok()
            .map(|ts| Self::Hour(ts.with_timezone(&Utc)))
    }

    pub fn as_date(&self) -> NaiveDate {
        match self {
            Self::Date(date) => *date,
            Self::Hour(ts) => ts.date_naive(),
        }
    }

    pub fn as_hour(&self) -> DateTime<Utc> {
        match self {
            Self::Date(date) => start_of_day(*date),
            Self::Hour(ts) => *ts,
        }
    }

    pub fn to_storage_string(&self) -> String {
        match self {
            Self::Date(date) => date.to_string(),
            Self::Hour(ts) => ts.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

/// Persisted progress for one provider. Passed by value into and out of the
/// orchestrator; `version` guards the compare-and-set on write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub provider: String,
    pub last_forward_cursor: Option<ForwardCursor>,
    pub oldest_backfilled_date: Option<NaiveDate>,
    pub backfill_complete: bool,
    #[serde(skip)]
    pub version: i64,
}

impl SyncState {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            last_forward_cursor: None,
            oldest_backfilled_date: None,
            backfill_complete: false,
            version: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub imported: u64,
    pub skipped: u64,
}

impl AddAssign for WriteStats {
    fn add_assign(&mut self, other: Self) {
        self.imported += other.imported;
        self.skipped += other.skipped;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncedRange {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardSyncResult {
    pub provider: String,
    pub success: bool,
    pub skipped: bool,
    pub rate_limited: bool,
    /// Seconds the provider asked callers to wait, when it said.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
    pub synced_range: Option<SyncedRange>,
    pub records_imported: u64,
    pub records_skipped: u64,
    pub errors: Vec<String>,
}

impl ForwardSyncResult {
    pub fn did_sync(&self) -> bool {
        self.synced_range.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillStatus {
    Complete,
    InProgress,
    RateLimited,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillResult {
    pub provider: String,
    pub success: bool,
    pub skipped: bool,
    pub rate_limited: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
    pub status: BackfillStatus,
    pub records_imported: u64,
    pub records_skipped: u64,
    pub errors: Vec<String>,
    pub last_processed_date: Option<NaiveDate>,
}

impl BackfillResult {
    pub fn status(&self) -> BackfillStatus {
        self.status
    }
}

pub fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn forward_cursor_round_trips_through_storage_text() {
        let date = ForwardCursor::Date(NaiveDate::from_ymd_opt(2025, 1, 2).unwrap());
        assert_eq!(date.to_storage_string(), "2025-01-02");
        assert_eq!(ForwardCursor::parse("2025-01-02"), Some(date));

        let hour = ForwardCursor::Hour(Utc.with_ymd_and_hms(2025, 1, 2, 13, 0, 0).unwrap());
        assert_eq!(hour.to_storage_string(), "2025-01-02T13:00:00Z");
        assert_eq!(ForwardCursor::parse("2025-01-02T13:00:00Z"), Some(hour));
        assert_eq!(ForwardCursor::parse("yesterday"), None);
    }

    #[test]
    fn forward_cursor_converts_between_cadences() {
        let hour = ForwardCursor::Hour(Utc.with_ymd_and_hms(2025, 3, 4, 5, 0, 0).unwrap());
        assert_eq!(hour.as_date(), NaiveDate::from_ymd_opt(2025, 3, 4).unwrap());

        let date = ForwardCursor::Date(NaiveDate::from_ymd_opt(2025, 3, 4).unwrap());
        assert_eq!(
            date.as_hour(),
            Utc.with_ymd_and_hms(2025, 3, 4, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn token_counts_add_saturates() {
        let mut totals = TokenCounts {
            input_tokens: u64::MAX,
            output_tokens: 1,
            ..TokenCounts::default()
        };
        totals += TokenCounts {
            input_tokens: 5,
            output_tokens: 2,
            cache_write_tokens: 3,
            cache_read_tokens: 4,
        };
        assert_eq!(totals.input_tokens, u64::MAX);
        assert_eq!(totals.output_tokens, 3);
        assert_eq!(totals.cache_write_tokens, 3);
        assert_eq!(totals.cache_read_tokens, 4);
        assert!(!totals.is_zero());
        assert!(TokenCounts::default().is_zero());
    }

    #[test]
    fn backfill_status_serializes_snake_case() {
        let value = serde_json::to_value(BackfillStatus::RateLimited).unwrap();
        assert_eq!(value, serde_json::json!("rate_limited"));
    }
}
