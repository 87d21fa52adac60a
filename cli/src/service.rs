// Copyright (c) 2026 Vigil Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Builds the scan service from configuration: Docker swarm backend, the
//! configured bus and in-process repositories.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use vigil_core::application::ScanService;
use vigil_core::domain::node_config::{OrchestratorConfig, MEMORY_BUS_URL};
use vigil_core::infrastructure::repositories::{
    InMemoryAgentGroupRepository, InMemoryScanRepository,
};
use vigil_core::infrastructure::{connect_bus, DockerSwarmBackend};

pub fn load_config(config_override: Option<PathBuf>) -> Result<OrchestratorConfig> {
    OrchestratorConfig::load_or_default(config_override).context("Failed to load configuration")
}

/// Swarm agents run in their own containers and can never reach the
/// in-process bus, so a scan against it would hang until its timeout.
pub fn require_shared_bus(config: &OrchestratorConfig) -> Result<()> {
    if config.bus.url == MEMORY_BUS_URL {
        anyhow::bail!(
            "bus.url is '{}', which agent containers cannot reach. \
             Point it at a shared bus such as redis://host:6379 (or set VIGIL_BUS_URL).",
            MEMORY_BUS_URL
        );
    }
    Ok(())
}

pub async fn build(config: OrchestratorConfig) -> Result<ScanService> {
    let backend = DockerSwarmBackend::new(config.backend.socket_path.as_deref())
        .context("Failed to create Docker backend")?;
    let bus = connect_bus(&config.bus.url)
        .await
        .with_context(|| format!("Failed to connect to bus at {}", config.bus.url))?;

    Ok(ScanService::assemble(
        config,
        Arc::new(backend),
        bus,
        Arc::new(InMemoryScanRepository::new()),
        Arc::new(InMemoryAgentGroupRepository::new()),
    ))
}
