use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use eventcast::config::Config;

mod commands;

#[derive(Parser)]
#[command(
    name = "eventcast",
    version,
    about = "Event aggregator and publication scheduler for announcement channels",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file (environment variables are used otherwise)
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
    /// Run the publication daemon
    Run {
        /// Log posts instead of sending them
        #[arg(long, default_value = "false")]
        dry_run: bool,

        /// Serve /metrics and /health on this address
        #[arg(long)]
        metrics_addr: Option<String>,
    },

    /// Publish the next due event now, then reschedule
    Tick {
        /// Log the post instead of sending it
        #[arg(long, default_value = "false")]
        dry_run: bool,
    },

    /// Re-derive the publish trigger from the queue
    Reschedule,

    /// Fetch all sources once
    Ingest,

    /// Run the daily maintenance now
    Maintain,

    /// Show queue counts and the outstanding trigger
    Status,

    /// Move an event from the inbox to the publication queue
    Approve {
        /// Event id
        id: String,
    },

    /// Move a queued event to its next posting slot
    Skip {
        /// Event id
        id: String,
    },

    /// Assign posting slots to queued events without one
    FillSlots,

    /// Delete events that ended before the retention grace
    Sweep,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;

    let format = cli
        .log_format
        .clone()
        .unwrap_or_else(|| config.logging.format.clone());
    setup_tracing(&format, &config.logging.level, cli.verbose)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "eventcast starting");

    match cli.command {
        Commands::Run {
            dry_run,
            metrics_addr,
        } => {
            tracing::info!(dry_run, metrics_addr = ?metrics_addr, "Starting daemon");
            commands::run(config, dry_run, metrics_addr).await?;
        }
        Commands::Tick { dry_run } => commands::tick(config, dry_run).await?,
        Commands::Reschedule => commands::reschedule(config).await?,
        Commands::Ingest => commands::ingest(config).await?,
        Commands::Maintain => commands::maintain(config).await?,
        Commands::Status => commands::status(config).await?,
        Commands::Approve { id } => commands::approve(config, &id).await?,
        Commands::Skip { id } => commands::skip(config, &id).await?,
        Commands::FillSlots => commands::fill_slots(config).await?,
        Commands::Sweep => commands::sweep(config).await?,
    }

    Ok(())
}

fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { level };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("eventcast={level},warn")));

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}
