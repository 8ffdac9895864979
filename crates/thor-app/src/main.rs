mod cli;
mod commands;

use anyhow::{Context, Result};
use clap::Parser;
use thor_core::Config;
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;
use crate::commands::App;

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = Config::from_file(&cli.config)
        .and_then(Config::with_env_overrides)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    let app = App::new(config)?;
    commands::dispatch(&app, cli.command)
}
