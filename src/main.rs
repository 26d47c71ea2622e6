mod cli;
mod clock;
mod config;
mod daemon;
mod debounce;
mod error;
mod feed;
mod models;
mod publisher;
mod recorder;
mod schedule;
mod storage;
mod stream;
mod watcher;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use crate::cli::{Cli, Commands};
use crate::clock::SystemClock;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Record { config: path } => {
            let config = config::load_recorder_config(&path)
                .with_context(|| format!("loading config from {}", path.display()))?;
            init_tracing(&config.log_level);
            info!(config_path = %path.display(), "config loaded");
            recorder::run(config).await
        }
        Commands::Publish { config: path } => {
            let config = config::load_publisher_config(&path)
                .with_context(|| format!("loading config from {}", path.display()))?;
            init_tracing(&config.log_level);
            info!(config_path = %path.display(), "config loaded");
            publisher::run(config).await
        }
        Commands::Validate { config: path, feed } => {
            if feed {
                let config = config::load_publisher_config(&path)
                    .with_context(|| format!("loading config from {}", path.display()))?;
                config.validate().context("config validation failed")?;
            } else {
                let config = config::load_recorder_config(&path)
                    .with_context(|| format!("loading config from {}", path.display()))?;
                config
                    .build_schedules(&SystemClock)
                    .context("config validation failed")?;
            }
            println!("Configuration is valid.");
            Ok(())
        }
    }
}

fn init_tracing(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
