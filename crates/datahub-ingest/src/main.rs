//! Datahub Ingest - statistical series ingestion worker

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use datahub_common::logging::{init_logging, LogConfig, LogLevel};
use datahub_ingest::{Catalog, GroupPipeline, IngestConfig, Orchestrator, SeriesStore};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "datahub-ingest")]
#[command(author, version, about = "BPstat series ingestion worker")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Series catalog (overrides DATAHUB_CATALOG_PATH)
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the ingestion pipeline
    Run {
        /// Only run these groups (repeatable); all groups when omitted
        #[arg(short, long = "group", value_name = "NAME")]
        groups: Vec<String>,
    },

    /// Create the store schema
    InitDb,

    /// Refetch one series and replace its stored history
    Resync {
        /// Catalog series key
        #[arg(short, long = "series", value_name = "KEY")]
        series: String,
    },

    /// List catalog groups
    Groups,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence over flags
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("datahub-ingest")
        .build()
        .merge_env()?;

    let _guard = init_logging(&log_config)?;

    let mut config = IngestConfig::from_env().context("Invalid configuration")?;
    if let Some(catalog) = cli.catalog {
        config.catalog_path = catalog;
    }

    match cli.command {
        Command::Run { groups } => {
            let catalog = load_catalog(&config)?;
            let selected = catalog.select(&groups)?;

            let orchestrator = Orchestrator::from_config(&config).await?;
            let summary = orchestrator.run(&selected).await;

            for report in summary.failed_groups() {
                warn!(
                    group = %report.group,
                    failed_at = ?report.failed_at,
                    error = ?report.error.as_ref().map(ToString::to_string),
                    "Group did not complete"
                );
            }

            if !summary.all_succeeded() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::InitDb => {
            config.validate()?;
            SeriesStore::connect(&config.db_path).await?;
            info!(db_path = %config.db_path, "Store schema ready");
        }
        Command::Resync { series } => {
            let catalog = load_catalog(&config)?;
            let group = catalog
                .series_group(&series)
                .ok_or_else(|| anyhow!("Series '{}' is not in the catalog", series))?;

            let orchestrator = Orchestrator::from_config(&config).await?;
            let report = GroupPipeline::new(orchestrator.context(), &group)
                .with_resync()
                .run()
                .await;

            if let Some(err) = report.error {
                warn!(series = %series, failed_at = ?report.failed_at, error = %err, "Resync failed");
                return Ok(ExitCode::FAILURE);
            }
            info!(series = %series, stored = report.stored.len(), "Resync complete");
        }
        Command::Groups => {
            let catalog = load_catalog(&config)?;
            for group in &catalog.groups {
                println!(
                    "{:<20} {:>3} series  policy={:?} cadence={:?}",
                    group.name,
                    group.series.len(),
                    group.policy,
                    group.cadence
                );
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn load_catalog(config: &IngestConfig) -> Result<Catalog> {
    Catalog::load(&config.catalog_path)
        .with_context(|| format!("Failed to load catalog {}", config.catalog_path.display()))
}
