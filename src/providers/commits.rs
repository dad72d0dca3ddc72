//! Commit history adapter (GitHub REST shape) and the ingest path shared with
//! the push webhook.

use super::{Cadence, Page, SyncProvider, SyncWindow, build_client, check_response};
use crate::{
    attribution::AttributionDetector,
    config::CommitsConfig,
    error::FetchError,
    identity::{DirectoryLookup, IdentityResolver},
    model::{NewCommit, WriteStats, start_of_day},
    storage::Storage,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, TimeDelta, Utc};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, warn};

pub const PROVIDER: &str = "commits";

const API_VERSION: &str = "2022-11-28";
const ACCEPT: &str = "application/vnd.github+json";

/// A commit as delivered by either the REST API or a push event.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingCommit {
    pub id: String,
    pub message: String,
    pub committed_at: DateTime<Utc>,
    pub author_email: String,
    pub author_login: Option<String>,
    pub additions: Option<u64>,
    pub deletions: Option<u64>,
}

/// Where a backward walk of history starts: strictly before a commit, or at
/// a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitCursor {
    Sha(String),
    Date(DateTime<Utc>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommitPage {
    pub commits: Vec<IncomingCommit>,
    /// Continues the walk from the last listed commit; `None` once history ran out.
    pub next: Option<CommitCursor>,
}

#[derive(Debug, Deserialize)]
struct ApiCommit {
    sha: String,
    commit: ApiCommitDetail,
    #[serde(default)]
    author: Option<ApiUser>,
    #[serde(default)]
    stats: Option<ApiStats>,
}

#[derive(Debug, Deserialize)]
struct ApiCommitDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    author: Option<ApiSignature>,
    #[serde(default)]
    committer: Option<ApiSignature>,
}

#[derive(Debug, Deserialize)]
struct ApiSignature {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ApiUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct ApiStats {
    #[serde(default)]
    additions: u64,
    #[serde(default)]
    deletions: u64,
}

#[derive(Debug, Deserialize)]
struct ApiProfile {
    #[serde(default)]
    email: Option<String>,
}

impl ApiCommit {
    /// The date the listing endpoint filters on: committer first, author as fallback.
    fn listed_at(&self) -> Option<DateTime<Utc>> {
        let date = |sig: &Option<ApiSignature>| sig.as_ref().and_then(|sig| sig.date);
        date(&self.commit.committer).or_else(|| date(&self.commit.author))
    }

    fn into_incoming(self) -> Option<IncomingCommit> {
        let author = self.commit.author;
        let committed_at = author
            .as_ref()
            .and_then(|sig| sig.date)
            .or_else(|| self.commit.committer.as_ref().and_then(|sig| sig.date))?;
        Some(IncomingCommit {
            id: self.sha,
            message: self.commit.message,
            committed_at,
            author_email: author.and_then(|sig| sig.email).unwrap_or_default(),
            author_login: self.author.map(|user| user.login),
            additions: self.stats.as_ref().map(|stats| stats.additions),
            deletions: self.stats.as_ref().map(|stats| stats.deletions),
        })
    }
}

#[derive(Clone)]
pub struct CommitClient {
    client: Client,
    base_url: String,
    token: Option<String>,
    per_page: u32,
}

impl CommitClient {
    pub fn new(config: &CommitsConfig, timeout_secs: u64) -> Self {
        Self {
            client: build_client(timeout_secs),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone().filter(|token| !token.trim().is_empty()),
            // A continuation page repeats its boundary commit.
            per_page: config.per_page.clamp(2, 100),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.token.is_some()
    }

    fn get(&self, path: &str) -> Result<RequestBuilder, FetchError> {
        let token = self.token.as_deref().ok_or(FetchError::NotConfigured)?;
        Ok(self
            .client
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, ACCEPT)
            .header("x-github-api-version", API_VERSION))
    }

    /// Walks `repo` history backward from `before`, newest first.
    pub async fn fetch_commits(
        &self,
        repo: &str,
        before: &CommitCursor,
        since: Option<DateTime<Utc>>,
    ) -> Result<CommitPage, FetchError> {
        let mut query: Vec<(&str, String)> = vec![("per_page", self.per_page.to_string())];
        match before {
            CommitCursor::Sha(sha) => query.push(("sha", sha.clone())),
            CommitCursor::Date(until) => query.push(("until", timestamp(*until))),
        }
        if let Some(since) = since {
            query.push(("since", timestamp(since)));
        }

        let response = self
            .get(&format!("/repos/{repo}/commits"))?
            .query(&query)
            .send()
            .await?;
        let raw: Vec<ApiCommit> = check_response(response).await?.json().await?;
        let full_page = raw.len() as u32 >= self.per_page;
        let (until, boundary) = match before {
            CommitCursor::Date(until) => (Some(*until), None),
            CommitCursor::Sha(sha) => (None, Some(sha.as_str())),
        };
        let next = raw
            .last()
            .filter(|last| full_page && Some(last.sha.as_str()) != boundary)
            .map(|last| CommitCursor::Sha(last.sha.clone()));
        let commits: Vec<IncomingCommit> = raw
            .into_iter()
            .filter(|commit| Some(commit.sha.as_str()) != boundary)
            .filter(|commit| {
                commit.listed_at().is_none_or(|listed| {
                    since.is_none_or(|since| listed >= since)
                        && until.is_none_or(|until| listed <= until)
                })
            })
            .filter_map(ApiCommit::into_incoming)
            .collect();

        debug!(
            provider = PROVIDER,
            repo,
            ?before,
            commits = commits.len(),
            "fetched commit page"
        );
        Ok(CommitPage { commits, next })
    }

    /// Per-commit diff stats as `(additions, deletions)`.
    pub async fn fetch_commit_stats(
        &self,
        repo: &str,
        sha: &str,
    ) -> Result<(u64, u64), FetchError> {
        let response = self
            .get(&format!("/repos/{repo}/commits/{sha}"))?
            .send()
            .await?;
        let commit: ApiCommit = check_response(response).await?.json().await?;
        let stats = commit
            .stats
            .ok_or_else(|| FetchError::Decode(format!("commit {sha} carries no stats")))?;
        Ok((stats.additions, stats.deletions))
    }

    /// Probes whether `repo` has any commit at or before `until`.
    pub async fn has_commits_before(
        &self,
        repo: &str,
        until: DateTime<Utc>,
    ) -> Result<bool, FetchError> {
        let response = self
            .get(&format!("/repos/{repo}/commits"))?
            .query(&[("until", timestamp(until)), ("per_page", "1".to_string())])
            .send()
            .await?;
        let raw: Vec<ApiCommit> = check_response(response).await?.json().await?;
        Ok(!raw.is_empty())
    }

    /// Public profile email of a VCS user, if they publish one.
    pub async fn fetch_user_email(&self, login: &str) -> Result<Option<String>, FetchError> {
        let response = self.get(&format!("/users/{login}"))?.send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let profile: ApiProfile = check_response(response).await?.json().await?;
        Ok(profile.email.filter(|email| !email.trim().is_empty()))
    }

    /// Fills in diff stats the payload did not carry. A rate limit aborts;
    /// any other failure leaves the stats unknown.
    pub async fn fill_missing_stats(
        &self,
        repo: &str,
        commits: &mut [IncomingCommit],
    ) -> Result<(), FetchError> {
        for commit in commits.iter_mut() {
            if commit.additions.is_some() && commit.deletions.is_some() {
                continue;
            }
            match self.fetch_commit_stats(repo, &commit.id).await {
                Ok((additions, deletions)) => {
                    commit.additions = Some(additions);
                    commit.deletions = Some(deletions);
                }
                Err(err) if err.is_rate_limited() => return Err(err),
                Err(err) => {
                    warn!(
                        provider = PROVIDER,
                        repo,
                        sha = %commit.id,
                        error = %err,
                        "failed to fetch commit stats"
                    );
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub written: WriteStats,
    pub ai_attributed: u64,
}

/// Normalizes commits (identity, attribution) and upserts them. Used by
/// polling and by the push webhook.
#[derive(Clone)]
pub struct CommitIngestor {
    storage: Storage,
    identities: IdentityResolver,
    detector: Arc<AttributionDetector>,
    source: String,
}

impl CommitIngestor {
    pub fn new(
        storage: Storage,
        identities: IdentityResolver,
        detector: Arc<AttributionDetector>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            identities,
            detector,
            source: source.into(),
        }
    }

    pub async fn ingest(
        &self,
        repo_full_name: &str,
        commits: Vec<IncomingCommit>,
    ) -> Result<IngestStats> {
        let mut stats = IngestStats::default();
        if commits.is_empty() {
            return Ok(stats);
        }

        let repository = self
            .storage
            .upsert_repository(&self.source, repo_full_name)
            .await?;
        let mut emails: HashMap<String, Option<String>> = HashMap::new();
        let mut rows = Vec::with_capacity(commits.len());

        for commit in commits {
            let resolved = match commit.author_login.as_deref() {
                Some(login) => match emails.get(login) {
                    Some(email) => email.clone(),
                    None => {
                        let email = self.identities.resolve(PROVIDER, login).await?;
                        emails.insert(login.to_string(), email.clone());
                        email
                    }
                },
                None => None,
            };
            let attribution = self.detector.detect(&commit.message);
            if attribution.is_some() {
                stats.ai_attributed += 1;
            }
            let (ai_tool, ai_model) = match attribution {
                Some(found) => (Some(found.tool), found.model),
                None => (None, None),
            };
            rows.push(NewCommit {
                commit_id: commit.id,
                author_email: resolved.unwrap_or(commit.author_email),
                author_id: commit.author_login,
                committed_at: commit.committed_at,
                message: commit.message,
                ai_tool,
                ai_model,
                additions: commit.additions,
                deletions: commit.deletions,
            });
        }

        stats.written = self.storage.upsert_commits(repository.id, &rows).await?;
        if stats.written.imported > 0 && !emails.is_empty() {
            if let Err(err) = self
                .identities
                .refresh_commit_counts(PROVIDER, &self.source)
                .await
            {
                warn!(
                    provider = PROVIDER,
                    error = %err,
                    "failed to refresh identity record counts"
                );
            }
        }
        Ok(stats)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolledCommit {
    pub repo: String,
    pub commit: IncomingCommit,
}

pub struct CommitProvider {
    client: CommitClient,
    repositories: Vec<String>,
    fetch_stats: bool,
    ingestor: CommitIngestor,
}

impl CommitProvider {
    pub fn new(config: &CommitsConfig, client: CommitClient, ingestor: CommitIngestor) -> Self {
        Self {
            client,
            repositories: config
                .repositories
                .iter()
                .map(|repo| repo.trim().trim_matches('/').to_string())
                .filter(|repo| !repo.is_empty())
                .collect(),
            fetch_stats: config.fetch_stats,
            ingestor,
        }
    }

    pub fn directory(&self) -> UserDirectory {
        UserDirectory {
            client: self.client.clone(),
        }
    }
}

/// Page cursor over all configured repositories: `"<repo index>"` starts a
/// repository, `"<repo index>:<sha>"` continues its walk below that commit.
fn parse_cursor(cursor: Option<&str>) -> Result<(usize, Option<String>), FetchError> {
    let Some(value) = cursor else {
        return Ok((0, None));
    };
    let (repo, sha) = match value.split_once(':') {
        Some((repo, sha)) if !sha.is_empty() => (repo, Some(sha.to_string())),
        Some(_) => return Err(FetchError::Decode(format!("invalid commit cursor {value}"))),
        None => (value, None),
    };
    let repo = repo
        .parse()
        .map_err(|_| FetchError::Decode(format!("invalid commit cursor {value}")))?;
    Ok((repo, sha))
}

#[async_trait]
impl SyncProvider for CommitProvider {
    type Record = PolledCommit;

    fn name(&self) -> &'static str {
        PROVIDER
    }

    fn cadence(&self) -> Cadence {
        Cadence::Daily
    }

    fn is_configured(&self) -> bool {
        self.client.is_configured() && !self.repositories.is_empty()
    }

    async fn fetch_page(
        &self,
        window: &SyncWindow,
        cursor: Option<&str>,
    ) -> Result<Page<PolledCommit>, FetchError> {
        if !self.is_configured() {
            return Err(FetchError::NotConfigured);
        }
        let (repo_index, after) = parse_cursor(cursor)?;
        let Some(repo) = self.repositories.get(repo_index) else {
            return Ok(Page::last(Vec::new()));
        };

        let before = match after {
            Some(sha) => CommitCursor::Sha(sha),
            None => CommitCursor::Date(window.end - TimeDelta::seconds(1)),
        };
        let fetched = self
            .client
            .fetch_commits(repo, &before, Some(window.start))
            .await?;
        let mut commits = fetched.commits;
        if self.fetch_stats {
            self.client.fill_missing_stats(repo, &mut commits).await?;
        }

        let next_cursor = match fetched.next {
            Some(CommitCursor::Sha(sha)) => Some(format!("{repo_index}:{sha}")),
            _ if repo_index + 1 < self.repositories.len() => Some((repo_index + 1).to_string()),
            _ => None,
        };
        Ok(Page {
            records: commits
                .into_iter()
                .map(|commit| PolledCommit {
                    repo: repo.clone(),
                    commit,
                })
                .collect(),
            next_cursor,
        })
    }

    async fn store_page(&self, records: Vec<PolledCommit>) -> Result<WriteStats> {
        let mut by_repo: Vec<(String, Vec<IncomingCommit>)> = Vec::new();
        for record in records {
            match by_repo.iter_mut().find(|(repo, _)| *repo == record.repo) {
                Some((_, commits)) => commits.push(record.commit),
                None => by_repo.push((record.repo, vec![record.commit])),
            }
        }

        let mut stats = WriteStats::default();
        for (repo, commits) in by_repo {
            stats += self.ingestor.ingest(&repo, commits).await?.written;
        }
        Ok(stats)
    }

    async fn history_exhausted(&self, day: NaiveDate) -> Result<bool, FetchError> {
        let until = start_of_day(day) - TimeDelta::seconds(1);
        for repo in &self.repositories {
            if self.client.has_commits_before(repo, until).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Resolves VCS logins to their public profile email.
pub struct UserDirectory {
    client: CommitClient,
}

#[async_trait]
impl DirectoryLookup for UserDirectory {
    fn name(&self) -> &'static str {
        "vcs_profiles"
    }

    async fn lookup(&self, external_ids: &[String]) -> Result<HashMap<String, String>, FetchError> {
        let mut found = HashMap::new();
        for login in external_ids {
            if let Some(email) = self.client.fetch_user_email(login).await? {
                found.insert(login.clone(), email);
            }
        }
        Ok(found)
    }
}

fn timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}
