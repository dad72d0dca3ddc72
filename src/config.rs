use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub usage_report: UsageReportConfig,
    #[serde(default)]
    pub hourly_events: HourlyEventsConfig,
    #[serde(default)]
    pub commits: CommitsConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub attribution: AttributionConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            Self::from_file(path)?
        } else {
            let default_path = PathBuf::from("usage-sync.toml");
            if default_path.exists() {
                Self::from_file(&default_path)?
            } else {
                Self::default()
            }
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self =
            toml::from_str(&contents).with_context(|| "failed to parse configuration TOML")?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(db_path) = env::var("USAGE_SYNC_DB_PATH") {
            self.storage.database_path = PathBuf::from(db_path);
        }
        if let Ok(key) = env::var("USAGE_SYNC_USAGE_REPORT_KEY") {
            self.usage_report.api_key = non_empty(key);
        }
        if let Ok(key) = env::var("USAGE_SYNC_HOURLY_EVENTS_KEY") {
            self.hourly_events.api_key = non_empty(key);
        }
        if let Ok(token) = env::var("USAGE_SYNC_COMMITS_TOKEN") {
            self.commits.token = non_empty(token);
        }
        if let Ok(secret) = env::var("USAGE_SYNC_WEBHOOK_SECRET") {
            self.commits.webhook_secret = non_empty(secret);
        }
        if let Ok(addr) = env::var("USAGE_SYNC_LISTEN_ADDR") {
            self.webhook.listen_addr = addr;
        }
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_max_errors")]
    pub max_errors: usize,
    #[serde(default = "default_backfill_batch_days")]
    pub backfill_batch_days: u32,
    #[serde(default = "default_initial_lookback_days")]
    pub initial_lookback_days: u32,
    #[serde(default = "default_initial_lookback_hours")]
    pub initial_lookback_hours: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_errors: default_max_errors(),
            backfill_batch_days: default_backfill_batch_days(),
            initial_lookback_days: default_initial_lookback_days(),
            initial_lookback_hours: default_initial_lookback_hours(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UsageReportConfig {
    #[serde(default = "default_usage_report_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_usage_report_tool")]
    pub tool: String,
    #[serde(default = "default_usage_report_page_size")]
    pub page_size: u32,
}

impl Default for UsageReportConfig {
    fn default() -> Self {
        Self {
            base_url: default_usage_report_base_url(),
            api_key: None,
            tool: default_usage_report_tool(),
            page_size: default_usage_report_page_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HourlyEventsConfig {
    #[serde(default = "default_hourly_events_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_hourly_events_tool")]
    pub tool: String,
    #[serde(default = "default_hourly_events_page_size")]
    pub page_size: u32,
}

impl Default for HourlyEventsConfig {
    fn default() -> Self {
        Self {
            base_url: default_hourly_events_base_url(),
            api_key: None,
            tool: default_hourly_events_tool(),
            page_size: default_hourly_events_page_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommitsConfig {
    #[serde(default = "default_commits_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_commit_source")]
    pub source: String,
    #[serde(default)]
    pub repositories: Vec<String>,
    #[serde(default = "default_commits_per_page")]
    pub per_page: u32,
    #[serde(default = "default_true")]
    pub fetch_stats: bool,
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

impl Default for CommitsConfig {
    fn default() -> Self {
        Self {
            base_url: default_commits_base_url(),
            token: None,
            source: default_commit_source(),
            repositories: Vec::new(),
            per_page: default_commits_per_page(),
            fetch_stats: true,
            webhook_secret: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_webhook_path")]
    pub path: String,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            path: default_webhook_path(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PricingConfig {
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_model_rates")]
    pub default: ModelPricing,
    #[serde(default = "default_model_pricing")]
    pub models: HashMap<String, ModelPricing>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            currency: default_currency(),
            default: default_model_rates(),
            models: default_model_pricing(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "ModelPricingInput")]
pub struct ModelPricing {
    pub input_per_1m: f64,
    pub output_per_1m: f64,
    pub cache_write_per_1m: Option<f64>,
    pub cache_read_per_1m: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ModelPricingInput {
    input_per_1m: Option<f64>,
    output_per_1m: Option<f64>,
    cache_write_per_1m: Option<f64>,
    cache_read_per_1m: Option<f64>,
    input_per_1k: Option<f64>,
    output_per_1k: Option<f64>,
    cache_write_per_1k: Option<f64>,
    cache_read_per_1k: Option<f64>,
}

impl From<ModelPricingInput> for ModelPricing {
    fn from(input: ModelPricingInput) -> Self {
        let input_per_1m = input
            .input_per_1m
            .or(input.input_per_1k.map(|value| value * 1000.0))
            .unwrap_or(0.0);
        let output_per_1m = input
            .output_per_1m
            .or(input.output_per_1k.map(|value| value * 1000.0))
            .unwrap_or(0.0);
        let cache_write_per_1m = input
            .cache_write_per_1m
            .or(input.cache_write_per_1k.map(|value| value * 1000.0));
        let cache_read_per_1m = input
            .cache_read_per_1m
            .or(input.cache_read_per_1k.map(|value| value * 1000.0));

        Self {
            input_per_1m,
            output_per_1m,
            cache_write_per_1m,
            cache_read_per_1m,
        }
    }
}

/// Co-author trailer rules: a trailer whose name or email contains `pattern`
/// attributes the commit to `tool`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TrailerRule {
    #[serde(rename = "match")]
    pub pattern: String,
    pub tool: String,
    #[serde(default)]
    pub model: Option<String>,
}

/// Free-text markers inside a commit message (e.g. a "Generated with" footer).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MarkerRule {
    #[serde(rename = "match")]
    pub pattern: String,
    pub tool: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttributionConfig {
    #[serde(default = "default_trailer_rules")]
    pub rules: Vec<TrailerRule>,
    #[serde(default = "default_marker_rules")]
    pub markers: Vec<MarkerRule>,
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            rules: default_trailer_rules(),
            markers: default_marker_rules(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdentityConfig {
    /// Operator-assigned `external_id = "email"` pairs.
    #[serde(default, rename = "static")]
    pub static_mappings: HashMap<String, String>,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("usage-sync.db")
}

fn default_max_errors() -> usize {
    10
}

fn default_backfill_batch_days() -> u32 {
    7
}

fn default_initial_lookback_days() -> u32 {
    7
}

fn default_initial_lookback_hours() -> u32 {
    24
}

fn default_request_timeout() -> u64 {
    30
}

fn default_usage_report_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_usage_report_tool() -> String {
    "claude_code".to_string()
}

fn default_usage_report_page_size() -> u32 {
    31
}

fn default_hourly_events_base_url() -> String {
    "https://api.cursor.com".to_string()
}

fn default_hourly_events_tool() -> String {
    "cursor".to_string()
}

fn default_hourly_events_page_size() -> u32 {
    500
}

fn default_commits_base_url() -> String {
    "https://api.github.com".to_string()
}

fn default_commit_source() -> String {
    "github".to_string()
}

fn default_commits_per_page() -> u32 {
    100
}

fn default_true() -> bool {
    true
}

fn default_listen_addr() -> String {
    "127.0.0.1:8788".to_string()
}

fn default_webhook_path() -> String {
    "/webhooks/commits".to_string()
}

fn default_max_body_bytes() -> usize {
    5 * 1024 * 1024
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_model_rates() -> ModelPricing {
    ModelPricing {
        input_per_1m: 3.0,
        output_per_1m: 15.0,
        cache_write_per_1m: Some(3.75),
        cache_read_per_1m: Some(0.3),
    }
}

fn default_model_pricing() -> HashMap<String, ModelPricing> {
    let mut models = HashMap::new();

    models.insert(
        "claude-opus-4".to_string(),
        ModelPricing {
            input_per_1m: 15.0,
            output_per_1m: 75.0,
            cache_write_per_1m: Some(18.75),
            cache_read_per_1m: Some(1.5),
        },
    );
    models.insert(
        "claude-opus-4-5".to_string(),
        ModelPricing {
            input_per_1m: 5.0,
            output_per_1m: 25.0,
            cache_write_per_1m: Some(6.25),
            cache_read_per_1m: Some(0.5),
        },
    );
    models.insert(
        "claude-sonnet-4".to_string(),
        ModelPricing {
            input_per_1m: 3.0,
            output_per_1m: 15.0,
            cache_write_per_1m: Some(3.75),
            cache_read_per_1m: Some(0.3),
        },
    );
    models.insert(
        "claude-3-7-sonnet".to_string(),
        ModelPricing {
            input_per_1m: 3.0,
            output_per_1m: 15.0,
            cache_write_per_1m: Some(3.75),
            cache_read_per_1m: Some(0.3),
        },
    );
    models.insert(
        "claude-haiku-4-5".to_string(),
        ModelPricing {
            input_per_1m: 1.0,
            output_per_1m: 5.0,
            cache_write_per_1m: Some(1.25),
            cache_read_per_1m: Some(0.1),
        },
    );
    models.insert(
        "claude-3-5-haiku".to_string(),
        ModelPricing {
            input_per_1m: 0.8,
            output_per_1m: 4.0,
            cache_write_per_1m: Some(1.0),
            cache_read_per_1m: Some(0.08),
        },
    );
    models.insert(
        "gpt-4.1".to_string(),
        ModelPricing {
            input_per_1m: 2.0,
            output_per_1m: 8.0,
            cache_write_per_1m: None,
            cache_read_per_1m: Some(0.5),
        },
    );
    models.insert(
        "gpt-5".to_string(),
        ModelPricing {
            input_per_1m: 1.25,
            output_per_1m: 10.0,
            cache_write_per_1m: None,
            cache_read_per_1m: Some(0.125),
        },
    );

    models
}

fn trailer(pattern: &str, tool: &str) -> TrailerRule {
    TrailerRule {
        pattern: pattern.to_string(),
        tool: tool.to_string(),
        model: None,
    }
}

fn default_trailer_rules() -> Vec<TrailerRule> {
    vec![
        trailer("noreply@anthropic.com", "claude_code"),
        trailer("claude", "claude_code"),
        trailer("cursoragent@cursor.com", "cursor"),
        trailer("cursor agent", "cursor"),
        trailer("copilot", "github_copilot"),
        trailer("codex", "codex"),
        trailer("aider", "aider"),
        trailer("gemini", "gemini"),
        trailer("devin-ai-integration", "devin"),
    ]
}

fn default_marker_rules() -> Vec<MarkerRule> {
    vec![MarkerRule {
        pattern: "generated with [claude code]".to_string(),
        tool: "claude_code".to_string(),
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        env, fs,
        path::PathBuf,
        sync::{Mutex, OnceLock},
    };
    use tempfile::NamedTempFile;

    #[test]
    fn load_from_file_reads_sections() {
        let _lock = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _db_guard = EnvGuard::unset("USAGE_SYNC_DB_PATH");
        let _key_guard = EnvGuard::unset("USAGE_SYNC_USAGE_REPORT_KEY");

        let file = NamedTempFile::new().unwrap();
        let toml = r#"
            [storage]
            database_path = "custom.db"

            [sync]
            max_errors = 3
            backfill_batch_days = 2

            [usage_report]
            api_key = "sk-admin"

            [commits]
            repositories = ["acme/api", "acme/web"]

            [pricing.models.test]
            input_per_1k = 0.001
            output_per_1m = 3.0

            [[attribution.rules]]
            match = "robot"
            tool = "robot_tool"
            model = "robot-1"

            [identity.static]
            key_1 = "dev@example.com"
        "#;
        fs::write(file.path(), toml).unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.storage.database_path, PathBuf::from("custom.db"));
        assert_eq!(config.sync.max_errors, 3);
        assert_eq!(config.sync.backfill_batch_days, 2);
        assert_eq!(config.sync.initial_lookback_days, 7);
        assert_eq!(config.usage_report.api_key.as_deref(), Some("sk-admin"));
        assert_eq!(config.usage_report.tool, "claude_code");
        assert_eq!(config.commits.repositories, vec!["acme/api", "acme/web"]);
        assert!(config.commits.fetch_stats);

        let pricing = config.pricing.models.get("test").unwrap();
        assert!((pricing.input_per_1m - 1.0).abs() < f64::EPSILON);
        assert!((pricing.output_per_1m - 3.0).abs() < f64::EPSILON);
        assert!(pricing.cache_read_per_1m.is_none());

        assert_eq!(config.attribution.rules.len(), 1);
        assert_eq!(config.attribution.rules[0].model.as_deref(), Some("robot-1"));
        assert!(!config.attribution.markers.is_empty());
        assert_eq!(
            config.identity.static_mappings.get("key_1").map(String::as_str),
            Some("dev@example.com")
        );
    }

    #[test]
    fn env_overrides_take_precedence() {
        let _lock = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _db_guard = EnvGuard::set("USAGE_SYNC_DB_PATH", "/tmp/usage-sync-test.db");
        let _key_guard = EnvGuard::set("USAGE_SYNC_USAGE_REPORT_KEY", "sk-from-env");
        let _secret_guard = EnvGuard::set("USAGE_SYNC_WEBHOOK_SECRET", "  ");
        let _addr_guard = EnvGuard::set("USAGE_SYNC_LISTEN_ADDR", "0.0.0.0:9000");

        let file = NamedTempFile::new().unwrap();
        fs::write(
            file.path(),
            r#"
            [storage]
            database_path = "ignored.db"

            [usage_report]
            api_key = "sk-from-file"

            [commits]
            webhook_secret = "from-file"
            "#,
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(
            config.storage.database_path,
            PathBuf::from("/tmp/usage-sync-test.db")
        );
        assert_eq!(config.usage_report.api_key.as_deref(), Some("sk-from-env"));
        assert_eq!(config.commits.webhook_secret, None);
        assert_eq!(config.webhook.listen_addr, "0.0.0.0:9000");
    }

    struct EnvGuard {
        key: &'static str,
        previous: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let previous = env::var(key).ok();
            unsafe { env::set_var(key, value) };
            Self { key, previous }
        }

        fn unset(key: &'static str) -> Self {
            let previous = env::var(key).ok();
            if previous.is_some() {
                unsafe { env::remove_var(key) };
            }
            Self { key, previous }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(ref value) = self.previous {
                unsafe { env::set_var(self.key, value) };
            } else {
                unsafe { env::remove_var(self.key) };
            }
        }
    }

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
}
