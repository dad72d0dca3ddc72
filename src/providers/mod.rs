//! Provider adapters behind one orchestration contract.
//!
//! Each adapter exposes page-at-a-time fetching for a time window and a
//! write step for one fetched page. The orchestrator decides when a window
//! is finished; adapters never loop over pages themselves.

pub mod commits;
pub mod hourly_events;
pub mod usage_report;

use crate::{
    error::FetchError,
    identity::IdentityResolver,
    model::{UsageBucket, WriteStats},
    storage::Storage,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{Client, Response, StatusCode};
use std::{collections::HashMap, time::Duration};
use tracing::warn;

const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// Provider aggregates per calendar day; cursors are dates.
    Daily,
    /// Provider aggregates per hour; cursors are hour boundaries.
    Hourly,
}

/// Half-open `[start, end)` range of provider time to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl SyncWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub records: Vec<T>,
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn last(records: Vec<T>) -> Self {
        Self {
            records,
            next_cursor: None,
        }
    }
}

#[async_trait]
pub trait SyncProvider: Send + Sync {
    /// Raw record as fetched, before normalization.
    type Record: Send + 'static;

    fn name(&self) -> &'static str;

    fn cadence(&self) -> Cadence;

    /// Whether credentials are present. Unconfigured providers are skipped.
    fn is_configured(&self) -> bool;

    async fn fetch_page(
        &self,
        window: &SyncWindow,
        cursor: Option<&str>,
    ) -> Result<Page<Self::Record>, FetchError>;

    /// Normalizes one fetched page and upserts it on its natural keys.
    async fn store_page(&self, records: Vec<Self::Record>) -> Result<WriteStats>;

    /// Asks the provider whether anything exists before `day`. Only consulted
    /// by backfill after a day came back empty.
    async fn history_exhausted(&self, _day: NaiveDate) -> Result<bool, FetchError> {
        Ok(false)
    }
}

pub(crate) fn build_client(timeout_secs: u64) -> Client {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .user_agent(concat!("usage-sync/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_default()
}

/// Maps non-success responses onto the fetch error taxonomy.
pub(crate) async fn check_response(response: Response) -> Result<Response, FetchError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok());
    let quota_exhausted = response
        .headers()
        .get("x-ratelimit-remaining")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim() == "0");

    match status {
        StatusCode::TOO_MANY_REQUESTS => Err(FetchError::RateLimited { retry_after }),
        StatusCode::FORBIDDEN if quota_exhausted => Err(FetchError::RateLimited { retry_after }),
        StatusCode::GONE => Err(FetchError::HistoryExhausted),
        _ => {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > ERROR_BODY_LIMIT {
                let mut cut = ERROR_BODY_LIMIT;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            Err(FetchError::Api {
                status: status.as_u16(),
                body,
            })
        }
    }
}

/// Sums rows that share a natural key within one page so a single upsert
/// carries the page's total for that key.
pub(crate) fn merge_buckets(buckets: Vec<UsageBucket>) -> Vec<UsageBucket> {
    let mut merged: Vec<UsageBucket> = Vec::with_capacity(buckets.len());
    let mut index: HashMap<(String, String, String, String), usize> = HashMap::new();
    for bucket in buckets {
        let key = (
            bucket.source_key.clone(),
            bucket.bucket_start.clone(),
            bucket.raw_model.clone(),
            bucket.event_key.clone(),
        );
        match index.get(&key) {
            Some(&pos) => {
                let existing = &mut merged[pos];
                existing.tokens += bucket.tokens;
                existing.estimated_cost += bucket.estimated_cost;
            }
            None => {
                index.insert(key, merged.len());
                merged.push(bucket);
            }
        }
    }
    merged
}

/// Shared write path of the two usage adapters.
pub(crate) async fn persist_usage(
    storage: &Storage,
    identities: &IdentityResolver,
    provider: &str,
    buckets: Vec<UsageBucket>,
    dropped: u64,
) -> Result<WriteStats> {
    let buckets = merge_buckets(buckets);
    let mut stats = storage.upsert_usage_buckets(&buckets).await?;
    stats.skipped += dropped;
    if stats.imported > 0 {
        if let Err(err) = identities.refresh_usage_counts(provider).await {
            warn!(provider, error = %err, "failed to refresh identity record counts");
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TokenCounts;
    use axum::{Router, http::HeaderMap, routing::get};
    use chrono::TimeZone;

    fn bucket(source_key: &str, input: u64) -> UsageBucket {
        UsageBucket {
            provider: "usage_report".to_string(),
            tool: "claude_code".to_string(),
            source_key: source_key.to_string(),
            bucket_start: "2025-01-02".to_string(),
            event_key: String::new(),
            date: NaiveDate::from_ymd_opt(2025, 1, 2).unwrap(),
            identity: source_key.to_string(),
            raw_model: "claude-sonnet-4-20250514".to_string(),
            normalized_model: "claude-sonnet-4".to_string(),
            model_variant: None,
            tokens: TokenCounts {
                input_tokens: input,
                ..TokenCounts::default()
            },
            estimated_cost: 1.0,
        }
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn window_is_half_open() {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap();
        let window = SyncWindow::new(start, end);
        assert!(window.contains(start));
        assert!(!window.contains(end));
    }

    #[test]
    fn merges_rows_sharing_a_key() {
        let merged = merge_buckets(vec![bucket("k1", 10), bucket("k1", 5), bucket("k2", 1)]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].tokens.input_tokens, 15);
        assert!((merged[0].estimated_cost - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn classifies_rate_limits_and_exhaustion() {
        let router = Router::new()
            .route(
                "/limited",
                get(|| async {
                    let mut headers = HeaderMap::new();
                    headers.insert("retry-after", "30".parse().unwrap());
                    (StatusCode::TOO_MANY_REQUESTS, headers, "slow down")
                }),
            )
            .route(
                "/quota",
                get(|| async {
                    let mut headers = HeaderMap::new();
                    headers.insert("x-ratelimit-remaining", "0".parse().unwrap());
                    (StatusCode::FORBIDDEN, headers, "quota")
                }),
            )
            .route("/forbidden", get(|| async { (StatusCode::FORBIDDEN, "nope") }))
            .route("/gone", get(|| async { StatusCode::GONE }));
        let base = serve(router).await;
        let client = build_client(5);

        let fetch = |path: &'static str| {
            let client = client.clone();
            let url = format!("{base}{path}");
            async move { check_response(client.get(url).send().await.unwrap()).await }
        };

        assert!(matches!(
            fetch("/limited").await,
            Err(FetchError::RateLimited { retry_after: Some(30) })
        ));
        assert!(matches!(
            fetch("/quota").await,
            Err(FetchError::RateLimited { retry_after: None })
        ));
        match fetch("/forbidden").await {
            Err(FetchError::Api { status, body }) => {
                assert_eq!(status, 403);
                assert_eq!(body, "nope");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(matches!(fetch("/gone").await, Err(FetchError::HistoryExhausted)));
    }
}
