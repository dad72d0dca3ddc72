//! Daily usage-report adapter (Anthropic Admin API shape).

use super::{Cadence, Page, SyncProvider, SyncWindow, build_client, check_response, persist_usage};
use crate::{
    config::UsageReportConfig,
    error::FetchError,
    identity::{DirectoryLookup, IdentityResolver},
    model::{TokenCounts, UsageBucket, WriteStats},
    normalize::{DEFAULT_MODEL, canonicalize_model},
    pricing::PricingTable,
    storage::Storage,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::{collections::HashMap, sync::Arc};
use tracing::debug;

pub const PROVIDER: &str = "usage_report";

const API_VERSION: &str = "2023-06-01";
const BUCKET_WIDTH: &str = "1d";
const USAGE_REPORT_PATH: &str = "/v1/organizations/usage_report/messages";
const API_KEYS_PATH: &str = "/v1/organizations/api_keys";
const USERS_PATH: &str = "/v1/organizations/users";
const DIRECTORY_PAGE_LIMIT: u32 = 100;
const DIRECTORY_MAX_PAGES: usize = 50;
/// Source key for usage the API reports without an API key (console usage).
const UNATTRIBUTED_KEY: &str = "unattributed";

#[derive(Debug, Deserialize)]
struct MessagesUsageReport {
    #[serde(default)]
    data: Vec<UsageDataBucket>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_page: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageDataBucket {
    starting_at: String,
    #[serde(default)]
    results: Vec<UsageResult>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct UsageResult {
    uncached_input_tokens: u64,
    cache_read_input_tokens: u64,
    cache_creation: CacheCreationUsage,
    output_tokens: u64,
    api_key_id: Option<String>,
    model: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CacheCreationUsage {
    ephemeral_1h_input_tokens: u64,
    ephemeral_5m_input_tokens: u64,
}

/// One `(day, api key, model)` aggregate from the report.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportRow {
    pub date: NaiveDate,
    pub api_key_id: Option<String>,
    pub model: Option<String>,
    pub tokens: TokenCounts,
}

pub struct UsageReportProvider {
    client: Client,
    config: UsageReportConfig,
    storage: Storage,
    identities: IdentityResolver,
    pricing: Arc<PricingTable>,
}

impl UsageReportProvider {
    pub fn new(
        config: UsageReportConfig,
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

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Directory of API keys and the users who created them.
    pub fn directory(&self) -> ApiKeyDirectory {
        ApiKeyDirectory {
            client: self.client.clone(),
            base_url: self.config.base_url.clone(),
            api_key: self.config.api_key.clone(),
        }
    }

    fn normalize(
        &self,
        rows: &[ReportRow],
        resolved: &HashMap<String, String>,
    ) -> Vec<UsageBucket> {
        rows.iter()
            .map(|row| {
                let source_key = row.api_key_id.as_deref().unwrap_or(UNATTRIBUTED_KEY);
                let raw_model = row
                    .model
                    .as_deref()
                    .map(str::trim)
                    .filter(|model| !model.is_empty())
                    .unwrap_or(DEFAULT_MODEL);
                let canonical = canonicalize_model(raw_model);
                UsageBucket {
                    provider: PROVIDER.to_string(),
                    tool: self.config.tool.clone(),
                    source_key: source_key.to_string(),
                    bucket_start: row.date.to_string(),
                    event_key: String::new(),
                    date: row.date,
                    identity: resolved
                        .get(source_key)
                        .cloned()
                        .unwrap_or_else(|| source_key.to_string()),
                    raw_model: raw_model.to_string(),
                    estimated_cost: self.pricing.estimate(&canonical.base, &row.tokens, None),
                    normalized_model: canonical.base,
                    model_variant: canonical.variant,
                    tokens: row.tokens,
                }
            })
            .collect()
    }
}

#[async_trait]
impl SyncProvider for UsageReportProvider {
    type Record = ReportRow;

    fn name(&self) -> &'static str {
        PROVIDER
    }

    fn cadence(&self) -> Cadence {
        Cadence::Daily
    }

    fn is_configured(&self) -> bool {
        self.api_key().is_ok()
    }

    async fn fetch_page(
        &self,
        window: &SyncWindow,
        cursor: Option<&str>,
    ) -> Result<Page<ReportRow>, FetchError> {
        let api_key = self.api_key()?;
        let mut query: Vec<(&str, String)> = vec![
            ("starting_at", rfc3339(window.start)),
            ("ending_at", rfc3339(window.end)),
            ("bucket_width", BUCKET_WIDTH.to_string()),
            ("group_by[]", "model".to_string()),
            ("group_by[]", "api_key_id".to_string()),
            ("limit", self.config.page_size.max(1).to_string()),
        ];
        if let Some(page) = cursor {
            query.push(("page", page.to_string()));
        }

        let response = self
            .client
            .get(self.url(USAGE_REPORT_PATH))
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .query(&query)
            .send()
            .await?;
        let report: MessagesUsageReport = check_response(response).await?.json().await?;

        let mut records = Vec::new();
        for bucket in report.data {
            let date = bucket_date(&bucket.starting_at)?;
            for result in bucket.results {
                records.push(ReportRow {
                    date,
                    api_key_id: result.api_key_id,
                    model: result.model,
                    tokens: TokenCounts {
                        input_tokens: result.uncached_input_tokens,
                        output_tokens: result.output_tokens,
                        cache_write_tokens: result
                            .cache_creation
                            .ephemeral_1h_input_tokens
                            .saturating_add(result.cache_creation.ephemeral_5m_input_tokens),
                        cache_read_tokens: result.cache_read_input_tokens,
                    },
                });
            }
        }

        let next_cursor = if report.has_more {
            report.next_page.filter(|page| !page.is_empty())
        } else {
            None
        };
        debug!(
            provider = PROVIDER,
            rows = records.len(),
            has_more = next_cursor.is_some(),
            "fetched usage report page"
        );
        Ok(Page {
            records,
            next_cursor,
        })
    }

    async fn store_page(&self, records: Vec<ReportRow>) -> Result<WriteStats> {
        let (rows, empty): (Vec<_>, Vec<_>) =
            records.into_iter().partition(|row| !row.tokens.is_zero());
        let key_ids: Vec<&str> = rows.iter().filter_map(|row| row.api_key_id.as_deref()).collect();
        let resolved = self.identities.resolve_all(PROVIDER, key_ids).await?;
        let buckets = self.normalize(&rows, &resolved);
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

#[derive(Debug, Deserialize)]
struct ListPage<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    last_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiKeyEntry {
    id: String,
    #[serde(default)]
    created_by: Option<Actor>,
}

#[derive(Debug, Deserialize)]
struct Actor {
    id: String,
}

#[derive(Debug, Deserialize)]
struct UserEntry {
    id: String,
    #[serde(default)]
    email: Option<String>,
}

/// Resolves API key ids to the email of the user who created the key.
pub struct ApiKeyDirectory {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl ApiKeyDirectory {
    async fn list<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<Vec<T>, FetchError> {
        let api_key = self
            .api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or(FetchError::NotConfigured)?;
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        let mut items = Vec::new();
        let mut after_id: Option<String> = None;

        for _ in 0..DIRECTORY_MAX_PAGES {
            let mut request = self
                .client
                .get(&url)
                .header("x-api-key", api_key)
                .header("anthropic-version", API_VERSION)
                .query(&[("limit", DIRECTORY_PAGE_LIMIT.to_string())]);
            if let Some(after) = after_id.as_deref() {
                request = request.query(&[("after_id", after)]);
            }
            let page: ListPage<T> = check_response(request.send().await?).await?.json().await?;
            items.extend(page.data);
            match (page.has_more, page.last_id) {
                (true, Some(last)) => after_id = Some(last),
                _ => break,
            }
        }
        Ok(items)
    }
}

#[async_trait]
impl DirectoryLookup for ApiKeyDirectory {
    fn name(&self) -> &'static str {
        "api_keys"
    }

    async fn lookup(&self, external_ids: &[String]) -> Result<HashMap<String, String>, FetchError> {
        let keys: Vec<ApiKeyEntry> = self.list(API_KEYS_PATH).await?;
        let users: Vec<UserEntry> = self.list(USERS_PATH).await?;
        let emails: HashMap<String, String> = users
            .into_iter()
            .filter_map(|user| user.email.map(|email| (user.id, email)))
            .collect();

        Ok(keys
            .into_iter()
            .filter(|key| external_ids.contains(&key.id))
            .filter_map(|key| {
                let creator = key.created_by?;
                let email = emails.get(&creator.id)?;
                Some((key.id, email.clone()))
            })
            .collect())
    }
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn bucket_date(starting_at: &str) -> Result<NaiveDate, FetchError> {
    DateTime::parse_from_rfc3339(starting_at)
        .map(|ts| ts.with_timezone(&Utc).date_naive())
        .map_err(|err| FetchError::Decode(format!("invalid bucket start {starting_at}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::PricingConfig, storage::test_storage};
    use axum::{
        Json, Router,
        extract::Query,
        http::{HeaderMap, StatusCode},
        routing::get,
    };
    use chrono::TimeZone;
    use serde_json::{Value, json};

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
        api_key: Option<&str>,
    ) -> (UsageReportProvider, Storage, tempfile::NamedTempFile) {
        let (storage, db) = test_storage().await;
        let config = UsageReportConfig {
            base_url,
            api_key: api_key.map(str::to_string),
            ..UsageReportConfig::default()
        };
        let provider = UsageReportProvider::new(
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
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 1, 3, 0, 0, 0).unwrap(),
        )
    }

    async fn report(
        headers: HeaderMap,
        Query(params): Query<Vec<(String, String)>>,
    ) -> (StatusCode, Json<Value>) {
        if headers.get("x-api-key").and_then(|v| v.to_str().ok()) != Some("sk-admin") {
            return (StatusCode::UNAUTHORIZED, Json(json!({})));
        }
        let page = params
            .iter()
            .find(|(key, _)| key == "page")
            .map(|(_, value)| value.clone());
        let body = match page.as_deref() {
            None => json!({
                "data": [{
                    "starting_at": "2025-01-01T00:00:00Z",
                    "ending_at": "2025-01-02T00:00:00Z",
                    "results": [{
                        "uncached_input_tokens": 1000,
                        "cache_read_input_tokens": 200,
                        "cache_creation": {"ephemeral_1h_input_tokens": 10, "ephemeral_5m_input_tokens": 5},
                        "output_tokens": 300,
                        "api_key_id": "apikey_01",
                        "model": "claude-sonnet-4-20250514"
                    }, {
                        "uncached_input_tokens": 0,
                        "cache_read_input_tokens": 0,
                        "cache_creation": {"ephemeral_1h_input_tokens": 0, "ephemeral_5m_input_tokens": 0},
                        "output_tokens": 0,
                        "api_key_id": "apikey_02",
                        "model": "claude-opus-4-20250514"
                    }]
                }],
                "has_more": true,
                "next_page": "page_2"
            }),
            Some(_) => json!({
                "data": [{
                    "starting_at": "2025-01-02T00:00:00Z",
                    "ending_at": "2025-01-03T00:00:00Z",
                    "results": [{
                        "uncached_input_tokens": 50,
                        "cache_read_input_tokens": 0,
                        "cache_creation": {"ephemeral_1h_input_tokens": 0, "ephemeral_5m_input_tokens": 0},
                        "output_tokens": 5,
                        "api_key_id": null,
                        "model": null
                    }]
                }],
                "has_more": false,
                "next_page": null
            }),
        };
        (StatusCode::OK, Json(body))
    }

    #[tokio::test]
    async fn fetches_pages_and_maps_token_classes() {
        let base = serve(Router::new().route(USAGE_REPORT_PATH, get(report))).await;
        let (provider, _storage, _db) = provider(base, Some("sk-admin")).await;

        let first = provider.fetch_page(&window(), None).await.unwrap();
        assert_eq!(first.next_cursor.as_deref(), Some("page_2"));
        assert_eq!(first.records.len(), 2);
        let row = &first.records[0];
        assert_eq!(row.date, NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
        assert_eq!(row.tokens.input_tokens, 1000);
        assert_eq!(row.tokens.cache_write_tokens, 15);
        assert_eq!(row.tokens.cache_read_tokens, 200);
        assert_eq!(row.tokens.output_tokens, 300);

        let second = provider.fetch_page(&window(), Some("page_2")).await.unwrap();
        assert!(second.next_cursor.is_none());
        assert_eq!(second.records[0].api_key_id, None);
    }

    #[tokio::test]
    async fn stores_normalized_rows_idempotently() {
        let base = serve(Router::new().route(USAGE_REPORT_PATH, get(report))).await;
        let (provider, storage, _db) = provider(base, Some("sk-admin")).await;
        let page = provider.fetch_page(&window(), None).await.unwrap();

        let stats = provider.store_page(page.records.clone()).await.unwrap();
        assert_eq!(stats, WriteStats { imported: 1, skipped: 1 });
        let stats = provider.store_page(page.records).await.unwrap();
        assert_eq!(stats, WriteStats { imported: 0, skipped: 2 });

        let day = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let records = storage
            .usage_records_between("claude_code", day, day)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].identity, "apikey_01");
        assert_eq!(records[0].raw_model, "claude-sonnet-4-20250514");
        assert_eq!(records[0].normalized_model, "claude-sonnet-4");
        assert!(records[0].estimated_cost > 0.0);

        let mappings = storage.identity_mappings(PROVIDER).await.unwrap();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].record_count, 1);
    }

    #[tokio::test]
    async fn missing_key_is_not_configured() {
        let (provider, _storage, _db) = provider("http://127.0.0.1:9".to_string(), None).await;
        assert!(!provider.is_configured());
        assert!(matches!(
            provider.fetch_page(&window(), None).await,
            Err(FetchError::NotConfigured)
        ));
    }

    #[tokio::test]
    async fn directory_maps_keys_to_creator_emails() {
        let router = Router::new()
            .route(
                API_KEYS_PATH,
                get(|| async {
                    Json(json!({
                        "data": [
                            {"id": "apikey_01", "created_by": {"id": "user_1", "type": "user"}},
                            {"id": "apikey_02", "created_by": {"id": "user_2", "type": "user"}}
                        ],
                        "has_more": false,
                        "last_id": "apikey_02"
                    }))
                }),
            )
            .route(
                USERS_PATH,
                get(|| async {
                    Json(json!({
                        "data": [{"id": "user_1", "email": "ada@acme.io"}],
                        "has_more": false
                    }))
                }),
            );
        let base = serve(router).await;
        let (provider, _storage, _db) = provider(base, Some("sk-admin")).await;

        let found = provider
            .directory()
            .lookup(&["apikey_01".to_string(), "apikey_02".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found["apikey_01"], "ada@acme.io");
    }
}
