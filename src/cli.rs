use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Command-line interface for the usage sync engine.
#[derive(Debug, Parser)]
#[command(author, version, about = "AI usage and commit attribution sync", long_about = None)]
pub struct Cli {
    /// Path to a TOML configuration file (defaults to ./usage-sync.toml if present).
    #[arg(long, value_name = "FILE", global = true)]
    pub config_path: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Bring a provider up to date from its forward cursor.
    Sync { provider: ProviderKind },
    /// Walk a provider's history backward by one batch.
    Backfill {
        provider: ProviderKind,
        /// Oldest date to reach, inclusive.
        #[arg(long, value_name = "YYYY-MM-DD")]
        target: NaiveDate,
    },
    /// Fill in emails for unmapped identities.
    SyncMappings { provider: ProviderKind },
    /// Print sync state and unmapped identity counts; all providers when omitted.
    Status { provider: Option<ProviderKind> },
    /// Print canonical daily usage records for one tool.
    Usage {
        tool: String,
        /// First date, inclusive.
        #[arg(long, value_name = "YYYY-MM-DD")]
        from: NaiveDate,
        /// Last date, inclusive; defaults to `--from`.
        #[arg(long, value_name = "YYYY-MM-DD")]
        to: Option<NaiveDate>,
    },
    /// Run the push webhook listener until interrupted.
    Serve,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProviderKind {
    UsageReport,
    HourlyEvents,
    Commits,
}
