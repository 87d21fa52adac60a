// Copyright (c) 2026 Vigil Contributors
// SPDX-License-Identifier: AGPL-3.0

//! vigil CLI
//!
//! Deploys agent groups onto a Docker swarm, feeds them assets over the
//! message bus and follows the scan until it finishes.

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod service;

use commands::{ConfigCommand, GroupCommand, ScanCommand};

#[derive(Parser)]
#[command(name = "vigil")]
#[command(version, about = "Scan orchestrator for bus-connected security agents", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, env = "VIGIL_CONFIG_PATH", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "VIGIL_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Validate, check and install agent groups
    #[command(subcommand)]
    Group(GroupCommand),

    /// Run scans
    #[command(subcommand)]
    Scan(ScanCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    match cli.command {
        Some(Commands::Config(command)) => commands::config::handle_command(command, cli.config).await,
        Some(Commands::Group(command)) => commands::group::handle_command(command, cli.config).await,
        Some(Commands::Scan(command)) => commands::scan::handle_command(command, cli.config).await,
        None => {
            eprintln!(
                "{}",
                "No command given. Run 'vigil --help' for usage.".yellow()
            );
            std::process::exit(1);
        }
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| anyhow::anyhow!("Invalid log level '{}': {}", level, e))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    Ok(())
}
