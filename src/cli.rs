use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "aircheck",
    about = "Records internet radio streams on a schedule and publishes them as podcast feeds"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the recording service
    Record {
        /// Path to the recorder configuration file
        #[arg(long, short, default_value = "config.yml")]
        config: PathBuf,
    },

    /// Run the feed publisher service
    Publish {
        /// Path to the publisher configuration file
        #[arg(long, short, default_value = "feed-config.yml")]
        config: PathBuf,
    },

    /// Validate a configuration file and exit
    Validate {
        /// Path to the configuration file
        #[arg(long, short, default_value = "config.yml")]
        config: PathBuf,

        /// Treat the file as a publisher configuration
        #[arg(long)]
        feed: bool,
    },
}
