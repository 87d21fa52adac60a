// Copyright (c) 2026 Vigil Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Scan commands
//!
//! Commands: run

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::{ColoredString, Colorize};
use std::path::PathBuf;

use vigil_core::application::ScanService;
use vigil_core::domain::agent_group::AgentGroupDefinition;
use vigil_core::domain::asset::Asset;
use vigil_core::domain::events::ScanEvent;
use vigil_core::domain::scan::{AggregateRisk, RiskRating, ScanId, ScanRecord, ScanState};
use vigil_core::infrastructure::event_bus::EventBusError;

use crate::commands::group::load_group;
use crate::service::{build, load_config, require_shared_bus};

#[derive(Subcommand)]
pub enum ScanCommand {
    /// Deploy an agent group, scan the given assets and wait for the result
    Run {
        /// Agent group definition (YAML)
        #[arg(short, long, value_name = "FILE")]
        group: PathBuf,

        /// Asset as kind:value, e.g. ip:10.0.0.0/24 or link:https://example.com
        #[arg(short, long = "asset", value_name = "KIND:VALUE", required = true)]
        assets: Vec<String>,

        /// Scan title
        #[arg(short, long, default_value = "vigil scan")]
        title: String,

        /// Print the final summary as JSON
        #[arg(long)]
        json: bool,
    },
}

pub async fn handle_command(command: ScanCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ScanCommand::Run {
            group,
            assets,
            title,
            json,
        } => run(group, assets, title, json, config_override).await,
    }
}

fn parse_assets(raw: &[String]) -> Result<Vec<Asset>> {
    raw.iter()
        .map(|a| Asset::parse_short(a).with_context(|| format!("Invalid asset '{}'", a)))
        .collect()
}

async fn run(
    group: PathBuf,
    raw_assets: Vec<String>,
    title: String,
    json: bool,
    config_override: Option<PathBuf>,
) -> Result<()> {
    let definition = load_group(&group)?;
    let assets = parse_assets(&raw_assets)?;
    let config = load_config(config_override)?;
    require_shared_bus(&config)?;
    let service = build(config).await?;

    let outcome = follow(&service, &title, &definition, assets, json).await;
    service.shutdown().await;
    let record = outcome?;

    match record.state {
        ScanState::Error => anyhow::bail!(
            "Scan {} failed: {}",
            record.id,
            record
                .failure
                .map(|f| format!("{:?}: {}", f.stage, f.message))
                .unwrap_or_else(|| "unknown failure".to_string())
        ),
        _ => Ok(()),
    }
}

async fn follow(
    service: &ScanService,
    title: &str,
    definition: &AgentGroupDefinition,
    assets: Vec<Asset>,
    json: bool,
) -> Result<ScanRecord> {
    let started = service.scan(title, definition, assets).await?;
    let id = started.record.id;
    let mut events = service.watch(id);
    if !json {
        println!(
            "{} scan {} with {} agent(s), scope {}",
            "▶".cyan(),
            id.to_string().bold(),
            definition.agents.len(),
            started.handle.scope()
        );
        println!("Press Ctrl+C to stop the scan.");
    }

    let mut stopping = false;
    loop {
        let current = service.record(id).await?;
        if current.state.is_terminal() {
            break;
        }

        tokio::select! {
            signal = tokio::signal::ctrl_c(), if !stopping => {
                signal.context("Failed to listen for Ctrl+C")?;
                if !json {
                    println!("{}", "Stopping scan...".yellow());
                }
                service.stop(id).await?;
                stopping = true;
            }
            event = events.recv() => match event {
                Ok(event) if !json => print_event(&event),
                Ok(_) | Err(EventBusError::Lagged(_)) => {}
                Err(e) => return Err(e.into()),
            },
        }
    }

    let record = service.record(id).await?;
    print_summary(service, id, &record, json).await?;
    Ok(record)
}

fn print_event(event: &ScanEvent) {
    match event {
        ScanEvent::StateChanged { to, failure, .. } => match failure {
            Some(failure) => println!(
                "  {} {} ({:?}: {})",
                "state".dimmed(),
                to.as_str().red(),
                failure.stage,
                failure.message
            ),
            None => println!("  {} {}", "state".dimmed(), to.as_str().bold()),
        },
        ScanEvent::VulnerabilityReported {
            risk_rating, title, ..
        } => println!("  {} [{}] {}", "vuln".dimmed(), rating_label(*risk_rating), title),
        ScanEvent::AssetCompleted { asset_id, .. } => {
            println!("  {} {}", "asset done".dimmed(), asset_id.as_str())
        }
        ScanEvent::AgentCompleted { agent_key, .. } => {
            println!("  {} {}", "agent done".dimmed(), agent_key)
        }
    }
}

fn rating_label(rating: RiskRating) -> ColoredString {
    let label = rating.to_string();
    match rating {
        RiskRating::Critical | RiskRating::High => label.red().bold(),
        RiskRating::Medium => label.yellow(),
        RiskRating::Low | RiskRating::Potentially => label.cyan(),
        _ => label.normal(),
    }
}

async fn print_summary(
    service: &ScanService,
    id: ScanId,
    record: &ScanRecord,
    json: bool,
) -> Result<()> {
    let risk = service.risk(id).await?;
    let progress = service.progress(id).await?;
    let vulnerabilities = service.vulnerabilities(id).await?;

    if json {
        let summary = serde_json::json!({
            "scan": record,
            "risk": risk,
            "progress": progress,
            "vulnerabilities": vulnerabilities,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!();
    println!("{}", "Scan summary:".bold());
    println!("  ID: {}", record.id);
    println!("  Title: {}", record.title);
    println!("  State: {}", record.state.as_str());
    let risk_label = match risk {
        AggregateRisk::Rated(rating) => rating_label(rating),
        AggregateRisk::Unknown => risk.to_string().dimmed(),
    };
    println!("  Risk: {}", risk_label);
    println!(
        "  Assets: {}/{} completed",
        progress.completed_assets, progress.total_assets
    );
    println!(
        "  Agents: {}/{} completed",
        progress.completed_agents, progress.expected_agents
    );
    println!("  Vulnerabilities: {}", vulnerabilities.len());
    for vuln in &vulnerabilities {
        println!("    [{}] {}", rating_label(vuln.risk_rating), vuln.title);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assets() {
        let assets = parse_assets(&[
            "ip:10.0.0.0/24".to_string(),
            "link:https://example.com".to_string(),
        ])
        .unwrap();
        assert_eq!(assets.len(), 2);
        assert!(matches!(assets[1], Asset::Link { .. }));

        assert!(parse_assets(&["ftp:example.com".to_string()]).is_err());
    }
}
