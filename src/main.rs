mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use raidcrawl::config::Config;

#[derive(Parser)]
#[command(
    name = "raidcrawl",
    version,
    about = "Adaptive carnage report crawler with transactional aggregate statistics",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file; environment variables are used when absent
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json); overrides the configuration
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl new carnage reports from the live edge
    Crawl {
        /// First instance id to crawl; defaults to the latest stored id
        /// minus the configured buffer
        #[arg(short, long)]
        start: Option<i64>,
    },

    /// Consume the analytics queue into ClickHouse
    Analytics,

    /// Retry every instance recorded in the missed log
    Reconcile,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    let format = cli
        .log_format
        .clone()
        .unwrap_or_else(|| config.logging.format.clone());
    setup_tracing(&format, &config.logging.level, cli.verbose)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "raidcrawl starting");

    match cli.command {
        Commands::Crawl { start } => {
            tracing::info!(start = ?start, "Starting crawl command");
            commands::crawl(config, start).await?;
        }
        Commands::Analytics => {
            tracing::info!("Starting analytics command");
            commands::analytics(config).await?;
        }
        Commands::Reconcile => {
            tracing::info!("Starting reconcile command");
            commands::reconcile(config).await?;
        }
    }

    tracing::info!("raidcrawl finished");
    Ok(())
}

fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("raidcrawl=debug,info")
    } else {
        tracing_subscriber::EnvFilter::new(format!("raidcrawl={level},warn"))
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()?;
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .try_init()?;
        }
    }

    Ok(())
}
