// Copyright (c) 2026 Vigil Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Agent group commands
//!
//! Commands: validate, check, install

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::{Path, PathBuf};

use vigil_core::domain::agent_group::AgentGroupDefinition;

use crate::service::{build, load_config};

#[derive(Subcommand)]
pub enum GroupCommand {
    /// Validate an agent group definition without touching the cluster
    Validate {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Check that the cluster can run the group: images present, selectors covered
    Check {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Pull the images of every agent in the group
    Install {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

pub async fn handle_command(command: GroupCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        GroupCommand::Validate { file } => validate(&file),
        GroupCommand::Check { file } => check(&file, config_override).await,
        GroupCommand::Install { file } => install(&file, config_override).await,
    }
}

pub fn load_group(path: &Path) -> Result<AgentGroupDefinition> {
    AgentGroupDefinition::from_yaml_file(path)
        .with_context(|| format!("Failed to load agent group from {}", path.display()))
}

fn validate(path: &Path) -> Result<()> {
    let definition = load_group(path)?;
    let errors = definition.validate();
    if !errors.is_empty() {
        println!("{}", format!("✗ {} is invalid:", path.display()).red());
        for error in &errors {
            println!("  - {}", error);
        }
        anyhow::bail!("{} validation error(s)", errors.len());
    }

    println!(
        "{}",
        format!(
            "✓ Agent group '{}' is valid ({} agents)",
            definition.name,
            definition.agents.len()
        )
        .green()
    );
    for agent in &definition.agents {
        println!("  {}", agent.key.bold());
    }
    Ok(())
}

async fn check(path: &Path, config_override: Option<PathBuf>) -> Result<()> {
    let definition = load_group(path)?;
    let service = build(load_config(config_override)?).await?;

    let result = service.check(&definition).await;
    service.shutdown().await;
    match result {
        Ok(()) => {
            println!(
                "{}",
                format!("✓ Agent group '{}' can run on this cluster", definition.name).green()
            );
            Ok(())
        }
        Err(e) => {
            println!("{}", format!("✗ Agent group '{}' cannot run", definition.name).red());
            Err(e.into())
        }
    }
}

async fn install(path: &Path, config_override: Option<PathBuf>) -> Result<()> {
    let definition = load_group(path)?;
    let service = build(load_config(config_override)?).await?;

    println!("Installing {} agent image(s)...", definition.agents.len());
    let result = service.install(&definition).await;
    service.shutdown().await;
    let report = result?;

    for key in &report.installed {
        println!("  {} {}", "✓".green(), key);
    }
    for failure in &report.failed {
        println!(
            "  {} {} ({}): {}",
            "✗".red(),
            failure.agent_key,
            failure.image,
            failure.reason
        );
    }

    if !report.is_complete() {
        anyhow::bail!("{} agent(s) failed to install", report.failed.len());
    }
    println!("{}", "✓ All agents installed".green());
    Ok(())
}
