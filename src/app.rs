use crate::{
    attribution::AttributionDetector,
    cli::{Command, ProviderKind},
    config::AppConfig,
    identity::{CommitEmailDetector, DirectoryLookup, IdentityResolver, StaticDirectory},
    orchestrator::{Orchestrator, OrchestratorSettings},
    pricing::PricingTable,
    providers::{
        SyncProvider,
        commits::{self, CommitClient, CommitIngestor, CommitProvider},
        hourly_events::{self, HourlyEventsProvider},
        usage_report::{self, UsageReportProvider},
    },
    storage::Storage,
    webhook::{self, WebhookProcessor},
};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Wires storage, providers and the orchestrator for one CLI invocation.
pub struct App {
    config: Arc<AppConfig>,
    storage: Storage,
    identities: IdentityResolver,
    orchestrator: Orchestrator,
    usage_report: UsageReportProvider,
    hourly_events: HourlyEventsProvider,
    commits: CommitProvider,
    ingestor: CommitIngestor,
    commit_client: CommitClient,
}

impl App {
    pub async fn new(config: AppConfig) -> Result<Self> {
        let config = Arc::new(config);
        let storage = Storage::connect(&config.storage.database_path).await?;
        storage.ensure_schema().await?;

        let pricing = Arc::new(PricingTable::from_config(&config.pricing));
        info!(
            currency = pricing.currency(),
            models = pricing.model_count(),
            "pricing table loaded"
        );
        let detector = Arc::new(AttributionDetector::new(&config.attribution));
        let identities = IdentityResolver::new(storage.clone(), config.sync.max_errors);
        let timeout = config.sync.request_timeout_secs;

        let usage_report = UsageReportProvider::new(
            config.usage_report.clone(),
            timeout,
            storage.clone(),
            identities.clone(),
            pricing.clone(),
        );
        let hourly_events = HourlyEventsProvider::new(
            config.hourly_events.clone(),
            timeout,
            storage.clone(),
            identities.clone(),
            pricing,
        );
        let commit_client = CommitClient::new(&config.commits, timeout);
        let ingestor = CommitIngestor::new(
            storage.clone(),
            identities.clone(),
            detector,
            config.commits.source.clone(),
        );
        let commits =
            CommitProvider::new(&config.commits, commit_client.clone(), ingestor.clone());
        let orchestrator =
            Orchestrator::new(storage.clone(), OrchestratorSettings::from(&config.sync));

        Ok(Self {
            config,
            storage,
            identities,
            orchestrator,
            usage_report,
            hourly_events,
            commits,
            ingestor,
            commit_client,
        })
    }

    pub async fn run(self, command: Command) -> Result<()> {
        match command {
            Command::Sync { provider } => match provider {
                ProviderKind::UsageReport => self.forward(&self.usage_report).await,
                ProviderKind::HourlyEvents => self.forward(&self.hourly_events).await,
                ProviderKind::Commits => self.forward(&self.commits).await,
            },
            Command::Backfill { provider, target } => match provider {
                ProviderKind::UsageReport => self.backfill(&self.usage_report, target).await,
                ProviderKind::HourlyEvents => self.backfill(&self.hourly_events, target).await,
                ProviderKind::Commits => self.backfill(&self.commits, target).await,
            },
            Command::SyncMappings { provider } => self.sync_mappings(provider).await,
            Command::Status { provider: None } => {
                print_json(&self.storage.list_sync_states().await?)
            }
            Command::Status {
                provider: Some(provider),
            } => {
                let (name, configured) = match provider {
                    ProviderKind::UsageReport => {
                        (usage_report::PROVIDER, self.usage_report.is_configured())
                    }
                    ProviderKind::HourlyEvents => {
                        (hourly_events::PROVIDER, self.hourly_events.is_configured())
                    }
                    ProviderKind::Commits => (commits::PROVIDER, self.commits.is_configured()),
                };
                print_json(&self.orchestrator.provider_status(name, configured).await?)
            }
            Command::Usage { tool, from, to } => print_json(
                &self
                    .storage
                    .usage_records_between(&tool, from, to.unwrap_or(from))
                    .await?,
            ),
            Command::Serve => self.serve().await,
        }
    }

    async fn forward<P: SyncProvider>(&self, provider: &P) -> Result<()> {
        print_json(&self.orchestrator.run_forward_sync(provider).await?)
    }

    async fn backfill<P: SyncProvider>(&self, provider: &P, target: NaiveDate) -> Result<()> {
        print_json(&self.orchestrator.run_backfill(provider, target).await?)
    }

    async fn sync_mappings(&self, provider: ProviderKind) -> Result<()> {
        let static_directory = StaticDirectory::new(self.config.identity.static_mappings.clone());
        let result = match provider {
            ProviderKind::UsageReport => {
                let keys = self.usage_report.directory();
                let directories: [&dyn DirectoryLookup; 2] = [&static_directory, &keys];
                self.identities
                    .sync_mappings(usage_report::PROVIDER, &directories)
                    .await?
            }
            ProviderKind::HourlyEvents => {
                let directories: [&dyn DirectoryLookup; 1] = [&static_directory];
                self.identities
                    .sync_mappings(hourly_events::PROVIDER, &directories)
                    .await?
            }
            ProviderKind::Commits => {
                let profiles = self.commits.directory();
                let detected = CommitEmailDetector::new(self.storage.clone());
                let directories: [&dyn DirectoryLookup; 3] =
                    [&static_directory, &profiles, &detected];
                self.identities
                    .sync_mappings(commits::PROVIDER, &directories)
                    .await?
            }
        };
        print_json(&result)
    }

    async fn serve(&self) -> Result<()> {
        let stats_client = (self.config.commits.fetch_stats && self.commit_client.is_configured())
            .then(|| self.commit_client.clone());
        let processor = Arc::new(WebhookProcessor::new(
            self.config.commits.webhook_secret.clone(),
            self.ingestor.clone(),
            stats_client,
            self.storage.clone(),
            self.config.sync.max_errors,
        ));
        if self.config.commits.webhook_secret.is_none() {
            warn!("no webhook secret configured; every delivery will be refused");
        }

        let handle = webhook::spawn(&self.config.webhook, processor).await?;
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for shutdown signal")?;
        info!("shutting down webhook listener");
        handle.shutdown().await
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("failed to render result")?;
    println!("{rendered}");
    Ok(())
}
