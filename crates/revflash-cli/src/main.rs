//! revflash - flash and restore vehicle ECUs from the command line
//!
//! Usage examples:
//!   revflash identify
//!   revflash monitor --duration 10
//!   revflash flash --vehicle 1HGCM82633A004352 --tune stage-1 --version 1.2.0
//!   revflash flash --vehicle 1HGCM82633A004352 --tune stage-1 --catalog tunes.yaml
//!   revflash restore --vehicle 1HGCM82633A004352
//!   revflash backups --vehicle 1HGCM82633A004352

mod commands;
mod config;
mod output;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use revflash_core::PackageCatalog;
use revflash_flash::{FileCatalog, FlashOrchestrator, FlashRequest, FsBackupStore, HttpCatalog};
use revflash_obd::{create_adapter, VehicleClient};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::Config;
use crate::output::{OutputContext, OutputFormat};

const DEFAULT_LOG_FILTER: &str =
    "revflash=info,revflash_cli=info,revflash_obd=info,revflash_flash=info";

/// revflash - ECU flash pipeline
#[derive(Parser)]
#[command(name = "revflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Config file path (TOML with adapter, poller, client and flash sections)
    #[arg(short, long, global = true, env = "REVFLASH_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value = "table")]
    output: OutputFormat,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read VIN and battery voltage
    Identify,

    /// Stream live telemetry (rpm, speed, throttle)
    Monitor {
        /// Stop after this many seconds
        #[arg(short, long)]
        duration: Option<u64>,
    },

    /// Flash a tune package onto the ECU
    Flash {
        /// Vehicle identifier
        #[arg(long)]
        vehicle: String,

        /// Tune identifier
        #[arg(long)]
        tune: String,

        /// Exact version label; latest when omitted
        #[arg(long)]
        version: Option<String>,

        /// Local YAML package index used instead of the remote catalog
        #[arg(long)]
        catalog: Option<PathBuf>,
    },

    /// Write the latest backup back to the ECU
    Restore {
        /// Vehicle identifier
        #[arg(long)]
        vehicle: String,
    },

    /// List stored ECU backups
    Backups {
        /// Vehicle identifier
        #[arg(long)]
        vehicle: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.json_logs);

    let config = Config::load(cli.config.as_deref())?;
    let ctx = OutputContext::new(cli.output, cli.no_color, cli.quiet);

    run(cli.command, config, &ctx).await
}

async fn run(command: Commands, config: Config, ctx: &OutputContext) -> Result<()> {
    match command {
        Commands::Identify => {
            let client = connect(&config).await?;
            commands::identify(&client, ctx).await?;
        }

        Commands::Monitor { duration } => {
            let client = Arc::new(VehicleClient::new(
                create_adapter(&config.adapter),
                config.client.clone(),
            ));
            commands::monitor(
                client,
                config.poller.clone(),
                duration.map(Duration::from_secs),
                ctx,
            )
            .await?;
        }

        Commands::Flash {
            vehicle,
            tune,
            version,
            catalog,
        } => {
            let catalog = create_catalog(&config, catalog)?;
            let client = connect(&config).await?;
            let orchestrator = Arc::new(
                FlashOrchestrator::from_config(client, &config.flash, catalog)
                    .context("Failed to set up flash pipeline")?,
            );
            let request = match version {
                Some(version) => FlashRequest::exact(vehicle, tune, version),
                None => FlashRequest::latest(vehicle, tune),
            };
            commands::flash(orchestrator, request, ctx).await?;
        }

        Commands::Restore { vehicle } => {
            let client = connect(&config).await?;
            let orchestrator =
                FlashOrchestrator::from_config(client, &config.flash, Arc::new(FileCatalog::new()))
                    .context("Failed to set up flash pipeline")?;
            commands::restore(&orchestrator, &vehicle, ctx).await?;
        }

        Commands::Backups { vehicle } => {
            let store = FsBackupStore::new(config.flash.storage.backups_dir());
            commands::backups(&store, &vehicle, ctx).await?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool, json: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}

/// Build a vehicle client for the configured adapter and connect it
async fn connect(config: &Config) -> Result<Arc<VehicleClient>> {
    let client = VehicleClient::new(create_adapter(&config.adapter), config.client.clone());
    client
        .connect()
        .await
        .with_context(|| format!("Failed to connect to {}", client.adapter_description()))?;
    Ok(Arc::new(client))
}

/// Local index when given, otherwise the configured remote catalog
fn create_catalog(config: &Config, index: Option<PathBuf>) -> Result<Arc<dyn PackageCatalog>> {
    if let Some(index) = index {
        let catalog = FileCatalog::from_yaml_file(&index)
            .with_context(|| format!("Failed to load package index: {}", index.display()))?;
        return Ok(Arc::new(catalog));
    }
    match &config.flash.catalog {
        Some(remote) => {
            let catalog = HttpCatalog::new(remote, &config.flash.timeouts)
                .context("Failed to create catalog client")?;
            Ok(Arc::new(catalog))
        }
        None => bail!("No tune catalog configured; pass --catalog or set [flash.catalog]"),
    }
}
