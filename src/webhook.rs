//! Inbound push webhook.
//!
//! The signature is checked over the raw body before anything is parsed, so
//! a forged or unsigned delivery never reaches storage. Verified push events
//! go through the same [`CommitIngestor`] as polling.

use crate::{
    config::WebhookConfig,
    error::{ErrorList, WebhookError},
    providers::commits::{CommitClient, CommitIngestor, IncomingCommit},
    storage::Storage,
};
use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};
use tracing::{info, warn};

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const EVENT_HEADER: &str = "x-github-event";
pub const DELIVERY_HEADER: &str = "x-github-delivery";

const SIGNATURE_PREFIX: &str = "sha256=";

type HmacSha256 = Hmac<Sha256>;

/// Checks a `sha256=<hex>` signature header against the raw request body.
/// The digest comparison is constant-time.
pub fn verify_signature(
    secret: &str,
    body: &[u8],
    header: Option<&str>,
) -> Result<(), WebhookError> {
    let header = header
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(WebhookError::MissingSignature)?;
    let digest = header
        .strip_prefix(SIGNATURE_PREFIX)
        .and_then(decode_hex)
        .ok_or(WebhookError::InvalidSignature)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| WebhookError::InvalidSignature)?;
    mac.update(body);
    mac.verify_slice(&digest)
        .map_err(|_| WebhookError::InvalidSignature)
}

fn decode_hex(value: &str) -> Option<Vec<u8>> {
    if value.len() % 2 != 0 {
        return None;
    }
    (0..value.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(value.get(i..i + 2)?, 16).ok())
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResult {
    pub success: bool,
    pub commits_processed: u64,
    pub ai_attributed_commits: u64,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// Configuration check sent when the hook is created.
    Ping,
    /// Any event other than `push`; accepted and dropped.
    Ignored { event: String },
    Push(PushResult),
}

#[derive(Debug, Deserialize)]
struct PushEvent {
    repository: PushRepository,
    #[serde(default)]
    commits: Vec<PushCommit>,
}

#[derive(Debug, Deserialize)]
struct PushRepository {
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct PushCommit {
    id: String,
    #[serde(default)]
    message: String,
    timestamp: DateTime<Utc>,
    author: PushAuthor,
    #[serde(default)]
    additions: Option<u64>,
    #[serde(default)]
    deletions: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct PushAuthor {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

impl From<PushCommit> for IncomingCommit {
    fn from(commit: PushCommit) -> Self {
        IncomingCommit {
            id: commit.id,
            message: commit.message,
            committed_at: commit.timestamp,
            author_email: commit.author.email.unwrap_or_default(),
            author_login: commit.author.username.filter(|name| !name.is_empty()),
            additions: commit.additions,
            deletions: commit.deletions,
        }
    }
}

pub struct WebhookProcessor {
    secret: Option<String>,
    ingestor: CommitIngestor,
    stats_client: Option<CommitClient>,
    storage: Storage,
    max_errors: usize,
}

impl WebhookProcessor {
    /// `stats_client` is consulted for commits whose payload lacks diff stats.
    pub fn new(
        secret: Option<String>,
        ingestor: CommitIngestor,
        stats_client: Option<CommitClient>,
        storage: Storage,
        max_errors: usize,
    ) -> Self {
        Self {
            secret: secret.filter(|secret| !secret.is_empty()),
            ingestor,
            stats_client,
            storage,
            max_errors,
        }
    }

    pub async fn handle_delivery(
        &self,
        event: Option<&str>,
        delivery_id: Option<&str>,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<DeliveryOutcome, WebhookError> {
        let secret = self.secret.as_deref().ok_or(WebhookError::MissingSecret)?;
        verify_signature(secret, body, signature)?;
        let event = event
            .filter(|event| !event.is_empty())
            .ok_or_else(|| WebhookError::InvalidPayload("missing event header".to_string()))?;

        let (outcome, processed) = match event {
            "ping" => {
                info!(delivery_id, "webhook ping received");
                (DeliveryOutcome::Ping, 0)
            }
            "push" => {
                let push: PushEvent = serde_json::from_slice(body)
                    .map_err(|err| WebhookError::InvalidPayload(err.to_string()))?;
                if push.repository.full_name.trim().is_empty() {
                    return Err(WebhookError::InvalidPayload(
                        "repository.full_name is empty".to_string(),
                    ));
                }
                let result = self.process_push(push).await;
                let processed = result.commits_processed;
                (DeliveryOutcome::Push(result), processed)
            }
            other => {
                info!(event = other, delivery_id, "ignoring webhook event");
                (
                    DeliveryOutcome::Ignored {
                        event: other.to_string(),
                    },
                    0,
                )
            }
        };

        if let Some(delivery_id) = delivery_id.filter(|id| !id.is_empty()) {
            self.storage
                .record_webhook_delivery(delivery_id, event, Utc::now(), processed)
                .await?;
        }
        Ok(outcome)
    }

    /// Stores every commit of the push. When stats cannot be fetched the
    /// commits are still written with unknown additions and deletions, and the
    /// result reports `success = false` with the stats error.
    async fn process_push(&self, push: PushEvent) -> PushResult {
        let repo = push.repository.full_name;
        let mut errors = ErrorList::new(self.max_errors);
        let mut commits: Vec<IncomingCommit> =
            push.commits.into_iter().map(IncomingCommit::from).collect();
        let total = commits.len() as u64;

        if let Some(client) = &self.stats_client {
            if let Err(err) = client.fill_missing_stats(&repo, &mut commits).await {
                warn!(repo = %repo, error = %err, "commit stats unavailable");
                errors.push(format!("commit stats for {repo}: {err}"));
            }
        }

        let mut result = PushResult::default();
        match self.ingestor.ingest(&repo, commits).await {
            Ok(stats) => {
                result.commits_processed = total;
                result.ai_attributed_commits = stats.ai_attributed;
                info!(
                    repo = %repo,
                    commits = total,
                    imported = stats.written.imported,
                    ai_attributed = stats.ai_attributed,
                    "push processed"
                );
            }
            Err(err) => {
                warn!(repo = %repo, error = %err, "failed to store pushed commits");
                errors.push(format!("{err:#}"));
            }
        }
        result.success = errors.is_empty();
        result.errors = errors.into_vec();
        result
    }
}

pub fn router(processor: Arc<WebhookProcessor>, path: &str, max_body_bytes: usize) -> Router {
    Router::new()
        .route(path, post(webhook_handler))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(processor)
}

async fn webhook_handler(
    State(processor): State<Arc<WebhookProcessor>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let header = |name: &str| headers.get(name).and_then(|value| value.to_str().ok());
    let outcome = processor
        .handle_delivery(
            header(EVENT_HEADER),
            header(DELIVERY_HEADER),
            header(SIGNATURE_HEADER),
            &body,
        )
        .await;

    match outcome {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(err) => {
            let status = match &err {
                WebhookError::MissingSignature | WebhookError::InvalidSignature => {
                    StatusCode::UNAUTHORIZED
                }
                WebhookError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
                WebhookError::MissingSecret => StatusCode::SERVICE_UNAVAILABLE,
                WebhookError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            warn!(status = status.as_u16(), error = %err, "webhook delivery rejected");
            (status, Json(json!({ "error": err.to_string() }))).into_response()
        }
    }
}

pub struct WebhookHandle {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<Result<()>>,
}

pub async fn spawn(
    config: &WebhookConfig,
    processor: Arc<WebhookProcessor>,
) -> Result<WebhookHandle> {
    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("failed to parse listen_addr {}", config.listen_addr))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind webhook listener on {addr}"))?;
    let local_addr = listener.local_addr()?;
    let router = router(processor, &config.path, config.max_body_bytes);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let join = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .map_err(|err| anyhow!(err))
    });

    info!(listen = %local_addr, path = %config.path, "webhook listener started");
    Ok(WebhookHandle {
        local_addr,
        shutdown: Some(shutdown_tx),
        join,
    })
}

impl WebhookHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.join.await {
            Ok(result) => result,
            Err(err) => Err(anyhow!(err)),
        }
    }
}
