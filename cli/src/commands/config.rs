// Copyright (c) 2026 Vigil Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use vigil_core::domain::node_config::OrchestratorConfig;

use crate::service::load_config;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show the effective configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Write a configuration file with every default spelled out
    Generate {
        /// Output path
        #[arg(short, long, default_value = "./vigil-config.yaml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub async fn handle_command(
    command: ConfigCommand,
    config_override: Option<PathBuf>,
) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output, force } => generate(output, force).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        match &config_override {
            Some(path) => println!("  1. --config flag: {}", path.display()),
            None => println!("  1. --config flag: {}", "(not set)".dimmed()),
        }
        println!(
            "  2. VIGIL_CONFIG_PATH: {}",
            std::env::var("VIGIL_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./vigil-config.yaml");
        println!("  4. ~/.vigil/config.yaml");
        println!("  5. /etc/vigil/config.yaml");
        println!();
    }

    let config = load_config(config_override)?;

    println!("{}", "Backend:".bold());
    println!(
        "  Docker socket: {}",
        config.backend.socket_path.as_deref().unwrap_or("(client default)")
    );
    println!("  Network: {}", config.backend.network.as_deref().unwrap_or("(none)"));
    println!(
        "  Registry prefix: {}",
        config.backend.registry_prefix.as_deref().unwrap_or("(none)")
    );
    println!("  Autopull: {}", config.backend.autopull);
    println!();

    println!("{}", "Bus:".bold());
    println!("  URL: {}", config.bus.url);
    println!();

    println!("{}", "Timeouts:".bold());
    println!("  Backend call: {:?}", config.timeouts.backend_call);
    println!("  Deploy health: {:?}", config.timeouts.deploy_health);
    println!("  Stop grace period: {:?}", config.timeouts.stop_grace_period);
    println!("  Agent idle: {:?}", config.timeouts.agent_idle);
    match config.timeouts.scan {
        Some(scan) => println!("  Scan: {:?}", scan),
        None => println!("  Scan: {}", "(unbounded)".dimmed()),
    }
    println!();

    println!("{}", "Tracing:".bold());
    println!(
        "  Collector: {}",
        config.tracing.collector_url.as_deref().unwrap_or("(disabled)")
    );

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    load_config(config_path).context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn generate(output: PathBuf, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "{} already exists. Pass --force to overwrite it.",
            output.display()
        );
    }

    let yaml = OrchestratorConfig::default().to_yaml_string()?;
    std::fs::write(&output, yaml)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration written to {}", output.display()).green()
    );
    println!("Edit bus.url to point agents at a shared Redis bus before scanning.");

    Ok(())
}
