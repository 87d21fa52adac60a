// Copyright (c) 2026 Vigil Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Caller-facing scan API: feasibility, install, scan, stop and read-side
//! queries. Every failure is an [`OrchestratorError`].
//!
//! `scan` never installs. Callers that want missing images pulled run
//! [`ScanService::install`] first and decide what a partial install means.

use crate::application::deployment::{DeploymentOrchestrator, StartedScan};
use crate::application::error::{InstallReport, OrchestratorError};
use crate::application::feasibility::FeasibilityChecker;
use crate::application::lifecycle::ScanLifecycle;
use crate::domain::agent_group::AgentGroupDefinition;
use crate::domain::asset::Asset;
use crate::domain::bus::MessageBus;
use crate::domain::node_config::OrchestratorConfig;
use crate::domain::repository::{AgentGroupId, AgentGroupRepository, ScanRepository};
use crate::domain::runtime::OrchestrationBackend;
use crate::domain::scan::{AggregateRisk, ScanId, ScanProgress, ScanRecord, VulnerabilityRecord};
use crate::infrastructure::event_bus::{EventBus, ScanEventReceiver};
use std::sync::Arc;
use tracing::info;

pub struct ScanService {
    feasibility: FeasibilityChecker,
    orchestrator: Arc<DeploymentOrchestrator>,
    scans: Arc<dyn ScanRepository>,
    groups: Arc<dyn AgentGroupRepository>,
}

impl ScanService {
    pub fn new(
        feasibility: FeasibilityChecker,
        orchestrator: Arc<DeploymentOrchestrator>,
        scans: Arc<dyn ScanRepository>,
        groups: Arc<dyn AgentGroupRepository>,
    ) -> Self {
        Self {
            feasibility,
            orchestrator,
            scans,
            groups,
        }
    }

    /// Wire lifecycle, orchestrator and feasibility checker around the given
    /// adapters. Must run inside a Tokio runtime.
    pub fn assemble(
        config: OrchestratorConfig,
        backend: Arc<dyn OrchestrationBackend>,
        bus: Arc<dyn MessageBus>,
        scans: Arc<dyn ScanRepository>,
        groups: Arc<dyn AgentGroupRepository>,
    ) -> Self {
        let lifecycle = ScanLifecycle::new(
            Arc::clone(&scans),
            Arc::clone(&bus),
            EventBus::with_default_capacity(),
            config.timeouts.scan,
        );
        let feasibility = FeasibilityChecker::new(
            Arc::clone(&backend),
            config.backend.registry_prefix.clone(),
            config.timeouts.backend_call,
        );
        let orchestrator = DeploymentOrchestrator::new(backend, bus, lifecycle, config);
        Self::new(feasibility, orchestrator, scans, groups)
    }

    fn lifecycle(&self) -> &Arc<ScanLifecycle> {
        self.orchestrator.lifecycle()
    }

    pub fn orchestrator(&self) -> &Arc<DeploymentOrchestrator> {
        &self.orchestrator
    }

    pub async fn can_run(&self, definition: &AgentGroupDefinition) -> bool {
        self.feasibility.can_run(definition).await
    }

    /// Like [`can_run`](Self::can_run) but says why not.
    pub async fn check(&self, definition: &AgentGroupDefinition) -> Result<(), OrchestratorError> {
        Ok(self.feasibility.check(definition).await?)
    }

    pub async fn install(
        &self,
        definition: &AgentGroupDefinition,
    ) -> Result<InstallReport, OrchestratorError> {
        let errors = definition.validate();
        if !errors.is_empty() {
            return Err(OrchestratorError::invalid_definition(&errors));
        }
        Ok(self.orchestrator.install(definition).await?)
    }

    pub async fn save_group(
        &self,
        definition: &AgentGroupDefinition,
    ) -> Result<AgentGroupId, OrchestratorError> {
        let errors = definition.validate();
        if !errors.is_empty() {
            return Err(OrchestratorError::invalid_definition(&errors));
        }
        Ok(self.groups.save(definition).await?)
    }

    /// Create a scan and deploy `definition` for it. On success the scan is
    /// IN_PROGRESS; a deployment failure leaves it in ERROR.
    pub async fn scan(
        &self,
        title: &str,
        definition: &AgentGroupDefinition,
        assets: Vec<Asset>,
    ) -> Result<StartedScan, OrchestratorError> {
        let errors = definition.validate();
        if !errors.is_empty() {
            return Err(OrchestratorError::invalid_definition(&errors));
        }
        if assets.is_empty() {
            return Err(OrchestratorError::Invalid(
                "a scan needs at least one asset".to_string(),
            ));
        }
        validate_assets(&assets)?;
        self.feasibility.check(definition).await?;

        let record = self.lifecycle().create(title, &definition.name).await?;
        let started = self
            .orchestrator
            .start(definition, record.id, &assets)
            .await?;
        info!(scan_id = %record.id, scope = %started.handle.scope(), "Scan '{}' started", title);
        Ok(started)
    }

    /// Scan with a previously saved agent group.
    pub async fn scan_group(
        &self,
        title: &str,
        group: AgentGroupId,
        assets: Vec<Asset>,
    ) -> Result<StartedScan, OrchestratorError> {
        let definition = self
            .groups
            .find_by_id(group)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("agent group {}", group.0)))?;
        self.scan(title, &definition, assets).await
    }

    /// Add assets to a running scan; already enqueued ones are skipped.
    pub async fn add_assets(
        &self,
        id: ScanId,
        assets: Vec<Asset>,
    ) -> Result<StartedScan, OrchestratorError> {
        validate_assets(&assets)?;
        Ok(self.orchestrator.add_assets(id, &assets).await?)
    }

    pub async fn stop(&self, id: ScanId) -> Result<ScanRecord, OrchestratorError> {
        Ok(self.orchestrator.stop(id).await?)
    }

    pub async fn record(&self, id: ScanId) -> Result<ScanRecord, OrchestratorError> {
        self.lifecycle()
            .record(id)
            .await
            .ok_or_else(|| OrchestratorError::NotFound(format!("scan {}", id)))
    }

    pub async fn list(&self) -> Vec<ScanRecord> {
        self.lifecycle().list().await
    }

    /// Remove a terminal scan. Running scans must be stopped first.
    pub async fn delete(&self, id: ScanId) -> Result<ScanRecord, OrchestratorError> {
        let record = self.lifecycle().delete(id).await?;
        self.orchestrator.teardown(id).await?;
        Ok(record)
    }

    pub async fn progress(&self, id: ScanId) -> Result<ScanProgress, OrchestratorError> {
        self.lifecycle()
            .progress(id)
            .await
            .ok_or_else(|| OrchestratorError::NotFound(format!("scan {}", id)))
    }

    pub async fn risk(&self, id: ScanId) -> Result<AggregateRisk, OrchestratorError> {
        self.lifecycle()
            .risk(id)
            .await
            .ok_or_else(|| OrchestratorError::NotFound(format!("scan {}", id)))
    }

    pub async fn vulnerabilities(
        &self,
        id: ScanId,
    ) -> Result<Vec<VulnerabilityRecord>, OrchestratorError> {
        Ok(self.scans.vulnerabilities(id).await?)
    }

    pub async fn statuses(&self, id: ScanId) -> Result<Vec<(String, String)>, OrchestratorError> {
        Ok(self.scans.statuses(id).await?)
    }

    pub fn watch(&self, id: ScanId) -> ScanEventReceiver {
        self.lifecycle().subscribe_scan(id)
    }

    pub async fn shutdown(&self) {
        self.orchestrator.shutdown().await;
    }
}

fn validate_assets(assets: &[Asset]) -> Result<(), OrchestratorError> {
    assets
        .iter()
        .try_for_each(Asset::validate)
        .map_err(|e| OrchestratorError::Invalid(e.to_string()))
}
