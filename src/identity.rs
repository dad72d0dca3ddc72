//! Identity mapping: opaque provider identifiers (API key ids, VCS logins)
//! to people's email addresses.
//!
//! Resolution never fails the caller. A miss records the identifier as an
//! unmapped row so operators can review it, and `sync_mappings` later fills
//! in emails from static configuration and provider directories. Usage and
//! commit rows written before a mapping existed are not rewritten.

use crate::{
    error::{ErrorList, FetchError},
    storage::Storage,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// A source of `external_id -> email` assignments.
#[async_trait]
pub trait DirectoryLookup: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns emails for whichever of `external_ids` the directory knows.
    async fn lookup(&self, external_ids: &[String]) -> Result<HashMap<String, String>, FetchError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingSyncResult {
    pub provider: String,
    pub candidates: u64,
    pub resolved: u64,
    pub errors: Vec<String>,
}

#[derive(Clone)]
pub struct IdentityResolver {
    storage: Storage,
    max_errors: usize,
}

impl IdentityResolver {
    pub fn new(storage: Storage, max_errors: usize) -> Self {
        Self {
            storage,
            max_errors,
        }
    }

    /// Returns the resolved email for `external_id`, recording the sighting.
    pub async fn resolve(&self, provider: &str, external_id: &str) -> Result<Option<String>> {
        let resolved = self
            .storage
            .touch_identity(provider, external_id, Utc::now())
            .await?;
        if resolved.is_none() {
            debug!(provider, external_id, "identity not mapped yet");
        }
        Ok(resolved)
    }

    /// Resolves every distinct id once, falling back to the id itself.
    pub async fn resolve_all<'a>(
        &self,
        provider: &str,
        external_ids: impl IntoIterator<Item = &'a str>,
    ) -> Result<HashMap<String, String>> {
        let mut resolved = HashMap::new();
        for external_id in external_ids {
            if resolved.contains_key(external_id) {
                continue;
            }
            let identity = self
                .resolve(provider, external_id)
                .await?
                .unwrap_or_else(|| external_id.to_string());
            resolved.insert(external_id.to_string(), identity);
        }
        Ok(resolved)
    }

    pub async fn refresh_usage_counts(&self, provider: &str) -> Result<()> {
        self.storage.refresh_usage_record_counts(provider).await
    }

    pub async fn refresh_commit_counts(&self, provider: &str, source: &str) -> Result<()> {
        self.storage.refresh_commit_record_counts(provider, source).await
    }

    /// Tries each directory in order against the still-unmapped rows and
    /// writes back the emails found. Directory failures are collected, and
    /// later directories still run.
    pub async fn sync_mappings(
        &self,
        provider: &str,
        directories: &[&dyn DirectoryLookup],
    ) -> Result<MappingSyncResult> {
        let unmapped = self.storage.unmapped_identities(provider).await?;
        let mut remaining: Vec<String> = unmapped
            .into_iter()
            .map(|mapping| mapping.external_id)
            .collect();
        let candidates = remaining.len() as u64;
        let mut resolved = 0;
        let mut errors = ErrorList::new(self.max_errors);

        for directory in directories {
            if remaining.is_empty() {
                break;
            }
            let found = match directory.lookup(&remaining).await {
                Ok(found) => found,
                Err(err) => {
                    warn!(
                        provider,
                        directory = directory.name(),
                        error = %err,
                        "directory lookup failed"
                    );
                    errors.push(format!("{}: {err}", directory.name()));
                    continue;
                }
            };

            for (external_id, email) in &found {
                if self
                    .storage
                    .set_resolved_email(provider, external_id, email)
                    .await?
                {
                    resolved += 1;
                }
            }
            remaining.retain(|external_id| !found.contains_key(external_id));
        }

        info!(provider, candidates, resolved, "identity mappings synced");
        Ok(MappingSyncResult {
            provider: provider.to_string(),
            candidates,
            resolved,
            errors: errors.into_vec(),
        })
    }
}

/// Operator-provided `external_id = "email"` pairs.
pub struct StaticDirectory {
    mappings: HashMap<String, String>,
}

impl StaticDirectory {
    pub fn new(mappings: HashMap<String, String>) -> Self {
        Self { mappings }
    }
}

#[async_trait]
impl DirectoryLookup for StaticDirectory {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn lookup(&self, external_ids: &[String]) -> Result<HashMap<String, String>, FetchError> {
        Ok(external_ids
            .iter()
            .filter_map(|id| {
                self.mappings
                    .get(id)
                    .filter(|email| !email.trim().is_empty())
                    .map(|email| (id.clone(), email.trim().to_string()))
            })
            .collect())
    }
}

/// Auto-detects a VCS user's email from the commits already recorded for them.
pub struct CommitEmailDetector {
    storage: Storage,
}

impl CommitEmailDetector {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl DirectoryLookup for CommitEmailDetector {
    fn name(&self) -> &'static str {
        "commit_authors"
    }

    async fn lookup(&self, external_ids: &[String]) -> Result<HashMap<String, String>, FetchError> {
        let mut found = HashMap::new();
        for external_id in external_ids {
            let email = self
                .storage
                .most_frequent_author_email(external_id)
                .await
                .map_err(|err| FetchError::Storage(format!("{err:#}")))?;
            if let Some(email) = email {
                found.insert(external_id.clone(), email);
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_storage;

    struct FailingDirectory;

    #[async_trait]
    impl DirectoryLookup for FailingDirectory {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn lookup(&self, _: &[String]) -> Result<HashMap<String, String>, FetchError> {
            Err(FetchError::Network("connection reset".to_string()))
        }
    }

    #[tokio::test]
    async fn misses_are_recorded_once_per_key() {
        let (storage, _db) = test_storage().await;
        let resolver = IdentityResolver::new(storage.clone(), 10);

        let resolved = resolver
            .resolve_all("usage_report", ["key_a", "key_a", "key_b"])
            .await
            .unwrap();
        assert_eq!(resolved["key_a"], "key_a");
        assert_eq!(resolved.len(), 2);
        assert_eq!(storage.identity_mappings("usage_report").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn sync_mappings_applies_directories_in_order() {
        let (storage, _db) = test_storage().await;
        let resolver = IdentityResolver::new(storage.clone(), 10);
        resolver.resolve("commits", "octocat").await.unwrap();
        resolver.resolve("commits", "hubot").await.unwrap();

        let static_dir = StaticDirectory::new(HashMap::from([
            ("octocat".to_string(), "oct@acme.io".to_string()),
            ("ghost".to_string(), "ghost@acme.io".to_string()),
        ]));
        let directories: [&dyn DirectoryLookup; 2] = [&FailingDirectory, &static_dir];
        let result = resolver
            .sync_mappings("commits", &directories)
            .await
            .unwrap();

        assert_eq!(result.candidates, 2);
        assert_eq!(result.resolved, 1);
        assert_eq!(result.errors, vec!["failing: network error: connection reset"]);
        assert_eq!(
            resolver.resolve("commits", "octocat").await.unwrap().as_deref(),
            Some("oct@acme.io")
        );
        let summary = storage.unmapped_summary("commits").await.unwrap();
        assert_eq!(summary.unmapped_keys, 1);
    }
}
