//! Shoal Worker - peer-to-peer worker framework
//!
//! Entry point for the `shoal-worker` binary. The worker loads its identity,
//! peers and seed from configuration, listens on its interfaces and serves
//! handshakes until interrupted.

use std::path::Path;

use clap::Parser;
use tracing::{info, warn};

use shoal_worker::cli::{Cli, Commands, ConfigSubcommand, SeedSubcommand};
use shoal_worker::config::{self, WorkerConfig};
use shoal_worker::error::{Error, Result};
use shoal_worker::protocol::PROTOCOL_VERSION;
use shoal_worker::{logging, seed, version, Worker};

fn main() -> Result<()> {
    // Parse CLI arguments first (before logging, so we know verbosity)
    let cli = Cli::parse();

    match &cli.command {
        Commands::Version => {
            version::print_version();
            return Ok(());
        }
        Commands::Config { subcommand } => {
            logging::init_console(tracing::Level::WARN)?;
            return handle_config_command(subcommand.clone());
        }
        Commands::Seed { subcommand } => {
            logging::init_console(tracing::Level::WARN)?;
            return handle_seed_command(subcommand.clone());
        }
        Commands::Run { .. } => {}
    }

    let config_path = match &cli.command {
        Commands::Run { config } => config.clone(),
        _ => None,
    };

    let config = match WorkerConfig::load(config_path.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprint!("{}", e.format_for_terminal());
            std::process::exit(e.exit_code());
        }
    };

    // The guards must be kept alive for the lifetime of the program
    let _log_guards = logging::init_logging(&config.logging, cli.verbose, cli.quiet)?;

    let build = version::BUILD;
    info!(
        version = %build.full_version(),
        protocol = %PROTOCOL_VERSION,
        target = %build.target,
        profile = %build.profile,
        "Starting shoal worker"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("shoal-worker")
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))?;

    if let Err(e) = runtime.block_on(run_worker(config)) {
        eprint!("{}", e.format_for_terminal());
        std::process::exit(e.exit_code());
    }
    Ok(())
}

/// Run the worker until Ctrl+C
async fn run_worker(config: WorkerConfig) -> Result<()> {
    let worker = Worker::from_config(&config).await?;

    if worker.my_worker_id() == 0 {
        warn!("No worker identity configured; this worker can only join a shoal");
    }
    if !worker.seed().is_imported() {
        warn!("No global random seed imported; groups and commissions are unavailable");
    }
    info!(
        worker_id = worker.my_worker_id(),
        peers = worker.directory().peer_count(),
        interfaces = ?worker.interfaces().interface_names(),
        "Worker running"
    );

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| Error::Internal(format!("Failed to listen for shutdown signal: {}", e)))?;
    info!("Shutdown signal received");

    worker.shutdown();
    Ok(())
}

/// Handle configuration subcommands
fn handle_config_command(subcommand: ConfigSubcommand) -> Result<()> {
    match subcommand {
        ConfigSubcommand::Show { config } => {
            let cfg = WorkerConfig::load(config.as_deref())?;
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        ConfigSubcommand::Init { path, force } => {
            let written = config::init_config(path.as_deref(), force)?;
            println!("Configuration written to {}", written.display());
        }
        ConfigSubcommand::Validate { config } => match WorkerConfig::load(config.as_deref()) {
            Ok(_) => {
                println!("Configuration is valid.");
            }
            Err(e) => {
                eprint!("{}", e.format_for_terminal());
                std::process::exit(e.exit_code());
            }
        },
    }

    Ok(())
}

/// Handle seed subcommands
fn handle_seed_command(subcommand: SeedSubcommand) -> Result<()> {
    match subcommand {
        SeedSubcommand::Generate { output, force } => {
            let path = shellexpand::tilde(&output).into_owned();
            if let Err(e) = seed::write_seed_file(Path::new(&path), force) {
                eprint!("{}", e.format_for_terminal());
                std::process::exit(e.exit_code());
            }
            println!("Seed written to {}", path);
        }
    }
    Ok(())
}
