mod app;
mod attribution;
mod cli;
mod config;
mod error;
mod identity;
mod model;
mod normalize;
mod orchestrator;
mod pricing;
mod providers;
mod storage;
mod webhook;

use anyhow::Result;
use clap::Parser;
use std::io;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = cli::Cli::parse();
    let config = config::AppConfig::load(cli.config_path.as_deref())?;
    let app = app::App::new(config).await?;
    app.run(cli.command).await
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries the JSON results; logs go to stderr.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .with_ansi(false)
        .try_init();
}
