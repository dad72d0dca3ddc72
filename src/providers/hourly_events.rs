//! Hourly usage-events adapter (Cursor Admin API shape).

use super::{Cadence, Page, SyncProvider, SyncWindow, build_client, check_response, persist_usage};
use crate::{
    config::HourlyEventsConfig,
    error::FetchError,
    identity::IdentityResolver,
    model::{TokenCounts, UsageBucket, WriteStats},
    normalize::{DEFAULT_MODEL, canonicalize_model},
    pricing::PricingTable,
    storage::Storage,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, warn};

pub const PROVIDER: &str = "hourly_events";

const EVENTS_PATH: &str = "/teams/filtered-usage-events";
const UNKNOWN_USER: &str = "unknown";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EventsQuery {
    start_date: i64,
    end_date: i64,
    page: u32,
    page_size: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsResponse {
    #[serde(default)]
    usage_events: Vec<RawEvent>,
    #[serde(default)]
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Pagination {
    #[serde(default)]
    has_next_page: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEvent {
    timestamp: Value,
    #[serde(default)]
    user_email: Option<String>,
    #[serde(default)]
    user_id: Option<Value>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    token_usage: Option<RawTokenUsage>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawTokenUsage {
    input_tokens: u64,
    output_tokens: u64,
    cache_write_tokens: u64,
    cache_read_tokens: u64,
    total_cents: f64,
}

/// Who an event belongs to: a known email, or an opaque user id that still
/// needs resolving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventUser {
    Email(String),
    UserId(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct UsageEvent {
    pub timestamp: DateTime<Utc>,
    pub user: EventUser,
    pub model: String,
    pub tokens: TokenCounts,
    pub reported_cost: Option<f64>,
}

pub struct HourlyEventsProvider {
    client: Client,
    config: HourlyEventsConfig,
    storage: Storage,
    identities: IdentityResolver,
    pricing: Arc<PricingTable>,
}

impl HourlyEventsProvider {
    pub fn new(
        config: HourlyEventsConfig,
        timeout_secs: u64,
        storage: Storage,
        identities: IdentityResolver,
        pricing: Arc<PricingTable>,
    ) -> Self {
        Self {
            client: build_client(timeout_secs),
            config,
            storage,
            identities,
            pricing,
        }
    }

    fn api_key(&self) -> Result<&str, FetchError> {
        self.config
            .api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or(FetchError::NotConfigured)
    }

    fn normalize(
        &self,
        events: &[UsageEvent],
        resolved: &HashMap<String, String>,
    ) -> Vec<UsageBucket> {
        let mut seen: HashMap<String, u32> = HashMap::new();
        events
            .iter()
            .map(|event| {
                let (source_key, identity) = match &event.user {
                    EventUser::Email(email) => (email.clone(), email.clone()),
                    EventUser::UserId(id) => (
                        id.clone(),
                        resolved.get(id).cloned().unwrap_or_else(|| id.clone()),
                    ),
                };
                let bucket_start = event.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true);
                let fingerprint = event_fingerprint(event);
                let ordinal = seen
                    .entry(format!("{source_key}|{bucket_start}|{}|{fingerprint}", event.model))
                    .or_default();
                let event_key = format!("{fingerprint}#{ordinal}");
                *ordinal += 1;
                let canonical = canonicalize_model(&event.model);
                let estimated_cost =
                    self.pricing.estimate(&canonical.base, &event.tokens, event.reported_cost);
                UsageBucket {
                    provider: PROVIDER.to_string(),
                    tool: self.config.tool.clone(),
                    source_key,
                    bucket_start,
                    event_key,
                    date: event.timestamp.date_naive(),
                    identity,
                    raw_model: event.model.clone(),
                    normalized_model: canonical.base,
                    model_variant: canonical.variant,
                    tokens: event.tokens,
                    estimated_cost,
                }
            })
            .collect()
    }
}

#[async_trait]
impl SyncProvider for HourlyEventsProvider {
    type Record = UsageEvent;

    fn name(&self) -> &'static str {
        PROVIDER
    }

    fn cadence(&self) -> Cadence {
        Cadence::Hourly
    }

    fn is_configured(&self) -> bool {
        self.api_key().is_ok()
    }

    async fn fetch_page(
        &self,
        window: &SyncWindow,
        cursor: Option<&str>,
    ) -> Result<Page<UsageEvent>, FetchError> {
        let api_key = self.api_key()?;
        let page = match cursor {
            Some(value) => value
                .parse::<u32>()
                .map_err(|_| FetchError::Decode(format!("invalid page cursor {value}")))?,
            None => 1,
        };
        // The API treats endDate as inclusive.
        let query = EventsQuery {
            start_date: window.start.timestamp_millis(),
            end_date: (window.end - TimeDelta::milliseconds(1)).timestamp_millis(),
            page,
            page_size: self.config.page_size.max(1),
        };

        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), EVENTS_PATH);
        let response = self
            .client
            .post(url)
            .basic_auth(api_key, None::<&str>)
            .json(&query)
            .send()
            .await?;
        let body: EventsResponse = check_response(response).await?.json().await?;

        let mut records = Vec::with_capacity(body.usage_events.len());
        for raw in body.usage_events {
            let event = parse_event(raw)?;
            if window.contains(event.timestamp) {
                records.push(event);
            }
        }

        let has_next = body.pagination.is_some_and(|pagination| pagination.has_next_page);
        debug!(
            provider = PROVIDER,
            page,
            events = records.len(),
            has_next,
            "fetched usage events page"
        );
        Ok(Page {
            records,
            next_cursor: has_next.then(|| (page + 1).to_string()),
        })
    }

    async fn store_page(&self, records: Vec<UsageEvent>) -> Result<WriteStats> {
        let (events, empty): (Vec<_>, Vec<_>) = records.into_iter().partition(|event| {
            !event.tokens.is_zero() || event.reported_cost.is_some_and(|cost| cost > 0.0)
        });
        let user_ids: Vec<&str> = events
            .iter()
            .filter_map(|event| match &event.user {
                EventUser::UserId(id) => Some(id.as_str()),
                EventUser::Email(_) => None,
            })
            .collect();
        let resolved = self.identities.resolve_all(PROVIDER, user_ids).await?;
        let buckets = self.normalize(&events, &resolved);
        persist_usage(
            &self.storage,
            &self.identities,
            PROVIDER,
            buckets,
            empty.len() as u64,
        )
        .await
    }
}

fn parse_event(raw: RawEvent) -> Result<UsageEvent, FetchError> {
    let timestamp = parse_millis(&raw.timestamp).ok_or_else(|| {
        FetchError::Decode(format!("invalid event timestamp {}", raw.timestamp))
    })?;

    let email = raw
        .user_email
        .map(|email| email.trim().to_ascii_lowercase())
        .filter(|email| !email.is_empty());
    let user_id = raw.user_id.as_ref().and_then(value_to_string);
    let user = match (email, user_id) {
        (Some(email), _) => EventUser::Email(email),
        (None, Some(id)) => EventUser::UserId(id),
        (None, None) => {
            warn!(provider = PROVIDER, %timestamp, "usage event without user");
            EventUser::UserId(UNKNOWN_USER.to_string())
        }
    };

    let usage = raw.token_usage.unwrap_or_default();
    let model = raw
        .model
        .map(|model| model.trim().to_string())
        .filter(|model| !model.is_empty())
        .unwrap_or_else(|| DEFAULT_MODEL.to_string());

    Ok(UsageEvent {
        timestamp,
        user,
        model,
        tokens: TokenCounts {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_write_tokens: usage.cache_write_tokens,
            cache_read_tokens: usage.cache_read_tokens,
        },
        reported_cost: (usage.total_cents > 0.0).then_some(usage.total_cents / 100.0),
    })
}

/// Token counts and reported cost of one event. Events sharing a user, model
/// and millisecond keep separate rows as long as their usage differs; exact
/// duplicates within a page are told apart by ordinal.
fn event_fingerprint(event: &UsageEvent) -> String {
    let tokens = &event.tokens;
    let cost = event
        .reported_cost
        .map(|cost| format!("{cost:.6}"))
        .unwrap_or_default();
    format!(
        "{}:{}:{}:{}:{cost}",
        tokens.input_tokens,
        tokens.output_tokens,
        tokens.cache_write_tokens,
        tokens.cache_read_tokens
    )
}

/// Epoch milliseconds, sent either as a JSON number or a numeric string.
fn parse_millis(value: &Value) -> Option<DateTime<Utc>> {
    let millis = match value {
        Value::Number(number) => number.as_i64()?,
        Value::String(text) => text.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    DateTime::from_timestamp_millis(millis)
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::PricingConfig, storage::test_storage};
    use axum::{Json, Router, http::HeaderMap, routing::post};
    use chrono::{NaiveDate, TimeZone};
    use serde_json::json;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn provider(
        base_url: String,
    ) -> (HourlyEventsProvider, Storage, tempfile::NamedTempFile) {
        let (storage, db) = test_storage().await;
        let config = HourlyEventsConfig {
            base_url,
            api_key: Some("key_cursor".to_string()),
            ..HourlyEventsConfig::default()
        };
        let provider = HourlyEventsProvider::new(
            config,
            5,
            storage.clone(),
            IdentityResolver::new(storage.clone(), 10),
            Arc::new(PricingTable::from_config(&PricingConfig::default())),
        );
        (provider, storage, db)
    }

    fn window() -> SyncWindow {
        SyncWindow::new(
            Utc.with_ymd_and_hms(2025, 1, 2, 10, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 1, 2, 12, 0, 0).unwrap(),
        )
    }

    async fn events(headers: HeaderMap, Json(query): Json<Value>) -> Json<Value> {
        assert!(headers.contains_key("authorization"));
        let in_window = Utc.with_ymd_and_hms(2025, 1, 2, 10, 30, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2025, 1, 2, 12, 0, 0).unwrap();
        assert_eq!(query["endDate"], json!(late.timestamp_millis() - 1));
        match query["page"].as_u64() {
            Some(1) => Json(json!({
                "usageEvents": [
                    {
                        "timestamp": in_window.timestamp_millis().to_string(),
                        "userEmail": "Dev@Acme.io",
                        "model": "claude-4-sonnet-thinking",
                        "tokenUsage": {"inputTokens": 100, "outputTokens": 20, "cacheReadTokens": 500, "totalCents": 4.5}
                    },
                    {
                        "timestamp": late.timestamp_millis(),
                        "userEmail": "dev@acme.io",
                        "model": "gpt-5"
                    }
                ],
                "pagination": {"hasNextPage": true, "currentPage": 1}
            })),
            _ => Json(json!({
                "usageEvents": [
                    {
                        "timestamp": in_window.timestamp_millis(),
                        "userId": 42,
                        "model": "auto",
                        "tokenUsage": {"inputTokens": 7, "outputTokens": 3}
                    }
                ],
                "pagination": {"hasNextPage": false, "currentPage": 2}
            })),
        }
    }

    #[tokio::test]
    async fn pages_through_events_inside_the_window() {
        let base = serve(Router::new().route(EVENTS_PATH, post(events))).await;
        let (provider, _storage, _db) = provider(base).await;

        let first = provider.fetch_page(&window(), None).await.unwrap();
        assert_eq!(first.next_cursor.as_deref(), Some("2"));
        assert_eq!(first.records.len(), 1);
        assert_eq!(first.records[0].user, EventUser::Email("dev@acme.io".to_string()));
        assert_eq!(first.records[0].tokens.cache_read_tokens, 500);
        assert_eq!(first.records[0].reported_cost, Some(0.045));

        let second = provider.fetch_page(&window(), Some("2")).await.unwrap();
        assert!(second.next_cursor.is_none());
        assert_eq!(second.records[0].user, EventUser::UserId("42".to_string()));
        assert_eq!(second.records[0].model, "auto");
    }

    #[tokio::test]
    async fn unmapped_user_ids_accumulate_on_one_mapping_row() {
        let (provider, storage, _db) = provider("http://127.0.0.1:9".to_string()).await;
        let event = |minute: u32| UsageEvent {
            timestamp: Utc.with_ymd_and_hms(2025, 1, 2, 10, minute, 0).unwrap(),
            user: EventUser::UserId("42".to_string()),
            model: "claude-4-sonnet".to_string(),
            tokens: TokenCounts {
                input_tokens: 10,
                ..TokenCounts::default()
            },
            reported_cost: None,
        };

        let stats = provider
            .store_page((0..5).map(event).collect())
            .await
            .unwrap();
        assert_eq!(stats.imported, 5);

        let mappings = storage.identity_mappings(PROVIDER).await.unwrap();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].external_id, "42");
        assert_eq!(mappings[0].record_count, 5);
        let summary = storage.unmapped_summary(PROVIDER).await.unwrap();
        assert_eq!(summary.unmapped_keys, 1);
        assert_eq!(summary.unmapped_records, 5);

        let day = NaiveDate::from_ymd_opt(2025, 1, 2).unwrap();
        let records = storage.usage_records_between("cursor", day, day).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].identity, "42");
        assert_eq!(records[0].tokens.input_tokens, 50);
    }

    #[tokio::test]
    async fn same_millisecond_events_on_separate_pages_both_count() {
        let (provider, storage, _db) = provider("http://127.0.0.1:9".to_string()).await;
        let event = |input: u64| UsageEvent {
            timestamp: Utc.with_ymd_and_hms(2025, 1, 2, 10, 15, 0).unwrap(),
            user: EventUser::UserId("42".to_string()),
            model: "claude-4-sonnet".to_string(),
            tokens: TokenCounts {
                input_tokens: input,
                ..TokenCounts::default()
            },
            reported_cost: None,
        };

        let first = provider.store_page(vec![event(100)]).await.unwrap();
        assert_eq!(first.imported, 1);
        let second = provider.store_page(vec![event(50)]).await.unwrap();
        assert_eq!(second.imported, 1);
        let replay = provider.store_page(vec![event(100)]).await.unwrap();
        assert_eq!(replay, WriteStats { imported: 0, skipped: 1 });
        let twins = provider.store_page(vec![event(7), event(7)]).await.unwrap();
        assert_eq!(twins.imported, 2);

        let day = NaiveDate::from_ymd_opt(2025, 1, 2).unwrap();
        let records = storage.usage_records_between("cursor", day, day).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].tokens.input_tokens, 164);
        let summary = storage.unmapped_summary(PROVIDER).await.unwrap();
        assert_eq!(summary.unmapped_records, 4);
    }

    #[test]
    fn timestamps_accept_numbers_and_strings() {
        let expected = Utc.with_ymd_and_hms(2025, 1, 2, 10, 30, 0).unwrap();
        let millis = expected.timestamp_millis();
        assert_eq!(parse_millis(&json!(millis)), Some(expected));
        assert_eq!(parse_millis(&json!(millis.to_string())), Some(expected));
        assert_eq!(parse_millis(&json!(null)), None);
    }
}
