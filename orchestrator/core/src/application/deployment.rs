// Copyright (c) 2026 Vigil Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Deployment Orchestrator
//!
//! Turns an agent group into running agent services for one scan:
//!
//! 1. allocate a fresh scan scope (namespace) no other scan holds
//! 2. create one backend service per agent, each bounded by the backend
//!    call timeout
//! 3. wait until every service is healthy, bounded by the deploy timeout
//! 4. hand the scan to [`ScanLifecycle::begin`] (IN_PROGRESS)
//! 5. publish the deduplicated asset messages on the scoped entry selectors
//!
//! Any failure before step 4 tears down whatever was created and moves the
//! scan to ERROR. No message is published under a scope before all of its
//! services are healthy.
//!
//! A background reaper follows scan state changes: DONE and ERROR scans are
//! torn down at once, STOPPED scans after the stop grace period.

use crate::application::error::{DeploymentError, InstallError, InstallReport};
use crate::application::feasibility::FeasibilityError;
use crate::application::lifecycle::ScanLifecycle;
use crate::domain::agent_group::{AgentGroupDefinition, AgentSettings};
use crate::domain::asset::{Asset, AssetId};
use crate::domain::bus::MessageBus;
use crate::domain::events::ScanEvent;
use crate::domain::message::MessageEnvelope;
use crate::domain::node_config::OrchestratorConfig;
use crate::domain::report::CancelRequest;
use crate::domain::runtime::{
    agent_env, OrchestrationBackend, RuntimeError, ServiceHealth, ServiceId, ServiceSpec,
};
use crate::domain::scan::{FailureStage, ScanId, ScanRecord, ScanState};
use crate::domain::selector::{self, well_known, ScanScope};
use crate::infrastructure::event_bus::EventBusError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SERVICE_NAME_MAX: usize = 63;

/// Scope a started scan runs under. Handed to the caller, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeploymentHandle {
    scan_id: ScanId,
    scope: ScanScope,
}

impl DeploymentHandle {
    pub fn scan_id(&self) -> ScanId {
        self.scan_id
    }

    pub fn scope(&self) -> ScanScope {
        self.scope
    }
}

#[derive(Debug, Clone)]
pub struct StartedScan {
    pub record: ScanRecord,
    pub handle: DeploymentHandle,
}

struct Deployment {
    handle: DeploymentHandle,
    /// Immutable snapshot of the group the scan was started with.
    definition: Arc<AgentGroupDefinition>,
    services: Vec<(String, ServiceId)>,
    released: bool,
}

#[derive(Default)]
struct Slot {
    deployment: Option<Deployment>,
}

pub struct DeploymentOrchestrator {
    backend: Arc<dyn OrchestrationBackend>,
    bus: Arc<dyn MessageBus>,
    lifecycle: Arc<ScanLifecycle>,
    config: OrchestratorConfig,
    slots: DashMap<ScanId, Arc<Mutex<Slot>>>,
    namespaces: DashMap<ScanScope, ScanId>,
    shutdown: CancellationToken,
}

impl DeploymentOrchestrator {
    /// Build the orchestrator and start its reaper. Must run inside a Tokio
    /// runtime.
    pub fn new(
        backend: Arc<dyn OrchestrationBackend>,
        bus: Arc<dyn MessageBus>,
        lifecycle: Arc<ScanLifecycle>,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        let orchestrator = Arc::new(Self {
            backend,
            bus,
            lifecycle,
            config,
            slots: DashMap::new(),
            namespaces: DashMap::new(),
            shutdown: CancellationToken::new(),
        });
        Self::spawn_reaper(&orchestrator);
        orchestrator
    }

    pub fn lifecycle(&self) -> &Arc<ScanLifecycle> {
        &self.lifecycle
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Make sure every agent image of the group is available locally,
    /// pulling missing ones when autopull is on. Agents are installed
    /// concurrently; one agent failing never aborts its siblings. Only an
    /// unreachable backend fails the whole call.
    pub async fn install(
        &self,
        definition: &AgentGroupDefinition,
    ) -> Result<InstallReport, FeasibilityError> {
        self.bounded("ping backend", self.backend.ping())
            .await
            .map_err(|e| FeasibilityError::BackendUnreachable(e.to_string()))?;

        let results = join_all(definition.agents.iter().map(|agent| self.install_agent(agent))).await;

        let mut report = InstallReport::default();
        for (agent, result) in definition.agents.iter().zip(results) {
            match result {
                Ok(()) => report.installed.push(agent.key.clone()),
                Err(e) => {
                    metrics::counter!("vigil_agent_install_failures_total").increment(1);
                    warn!(agent = %agent.key, "{}", e);
                    report.failed.push(e);
                }
            }
        }
        info!(
            agent_group = %definition.name,
            installed = report.installed.len(),
            failed = report.failed.len(),
            "Agent group install finished"
        );
        Ok(report)
    }

    async fn install_agent(&self, agent: &AgentSettings) -> Result<(), InstallError> {
        let image = agent
            .image(self.config.backend.registry_prefix.as_deref())
            .map_err(|e| InstallError {
                agent_key: agent.key.clone(),
                image: String::new(),
                reason: e.to_string(),
            })?;
        let failed = |reason: String| InstallError {
            agent_key: agent.key.clone(),
            image: image.to_string(),
            reason,
        };

        let present = self
            .bounded("inspect image", self.backend.image_present(&image))
            .await
            .map_err(|e| failed(e.to_string()))?;
        if present {
            debug!(agent = %agent.key, %image, "Image already present");
            return Ok(());
        }
        if !self.config.backend.autopull {
            return Err(failed("image not present and autopull is disabled".to_string()));
        }

        // Pulls routinely outlast a single API call; bound them by the deploy timeout.
        let pull = self.backend.pull_image(&image);
        match tokio::time::timeout(self.config.timeouts.deploy_health, pull).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(failed(e.to_string())),
            Err(_) => Err(failed(format!(
                "pull timed out after {:?}",
                self.config.timeouts.deploy_health
            ))),
        }
    }

    fn slot(&self, id: ScanId) -> Arc<Mutex<Slot>> {
        self.slots.entry(id).or_default().value().clone()
    }

    /// Drop the slot of a scan that will never deploy again. Only removes
    /// `slot` itself, never a newer one for the same id.
    fn discard_slot(&self, id: ScanId, slot: &Arc<Mutex<Slot>>) {
        self.slots.remove_if(&id, |_, current| Arc::ptr_eq(current, slot));
    }

    pub async fn handle(&self, id: ScanId) -> Option<DeploymentHandle> {
        let slot = self.slots.get(&id).map(|s| s.value().clone())?;
        let slot = slot.lock().await;
        slot.deployment.as_ref().map(|d| d.handle)
    }

    /// Scopes currently held by deployed, not yet released scans.
    pub fn active_scopes(&self) -> Vec<ScanScope> {
        self.namespaces.iter().map(|e| *e.key()).collect()
    }

    fn allocate_scope(&self, id: ScanId) -> ScanScope {
        loop {
            let scope = ScanScope::generate();
            if let Entry::Vacant(vacant) = self.namespaces.entry(scope) {
                vacant.insert(id);
                return scope;
            }
        }
    }

    /// Deploy the group for scan `id` and start it. Only NOT_STARTED scans
    /// can be started; use [`add_assets`](Self::add_assets) to feed a running
    /// scan.
    pub async fn start(
        &self,
        definition: &AgentGroupDefinition,
        id: ScanId,
        assets: &[Asset],
    ) -> Result<StartedScan, DeploymentError> {
        let slot_ref = self.slot(id);
        let mut slot = slot_ref.lock().await;
        let Some(record) = self.lifecycle.record(id).await else {
            self.discard_slot(id, &slot_ref);
            return Err(DeploymentError::UnknownScan(id));
        };

        if slot.deployment.is_some() || record.state != ScanState::NotStarted {
            if slot.deployment.is_none() {
                self.discard_slot(id, &slot_ref);
            }
            return Err(DeploymentError::AlreadyStarted {
                id,
                state: record.state,
            });
        }

        let handle = DeploymentHandle {
            scan_id: id,
            scope: self.allocate_scope(id),
        };
        let deployment = slot.deployment.insert(Deployment {
            handle,
            definition: Arc::new(definition.clone()),
            services: Vec::new(),
            released: false,
        });
        info!(scan_id = %id, scope = %handle.scope, agents = definition.agents.len(), "Deploying agent group '{}'", definition.name);

        if let Err(e) = self.deploy(deployment).await {
            error!(scan_id = %id, "Deployment failed: {}", e);
            self.release(deployment).await;
            self.record_failure(id, FailureStage::Deployment, e.to_string())
                .await;
            return Err(e);
        }

        let agent_keys = deployment.definition.agent_keys();
        let record = match self.lifecycle.begin(id, handle.scope, agent_keys).await {
            Ok(record) => record,
            Err(e) => {
                self.release(deployment).await;
                self.record_failure(id, FailureStage::Bus, e.to_string()).await;
                return Err(e);
            }
        };

        if let Err(e) = self.inject_assets(id, handle.scope, assets).await {
            // The reaper tears the deployment down once the scan is in ERROR.
            self.record_failure(id, FailureStage::Bus, format!("asset injection failed: {}", e))
                .await;
            return Err(e);
        }

        Ok(StartedScan { record, handle })
    }

    /// Feed more assets to a running scan. Assets already enqueued for it
    /// are skipped.
    pub async fn add_assets(
        &self,
        id: ScanId,
        assets: &[Asset],
    ) -> Result<StartedScan, DeploymentError> {
        let Some(slot) = self.slots.get(&id).map(|s| s.value().clone()) else {
            let record = self
                .lifecycle
                .record(id)
                .await
                .ok_or(DeploymentError::UnknownScan(id))?;
            return Err(DeploymentError::NotRunning {
                id,
                state: record.state,
            });
        };
        let slot = slot.lock().await;
        let record = self
            .lifecycle
            .record(id)
            .await
            .ok_or(DeploymentError::UnknownScan(id))?;

        match &slot.deployment {
            Some(deployment) if record.state == ScanState::InProgress && !deployment.released => {
                let handle = deployment.handle;
                self.inject_assets(id, handle.scope, assets).await?;
                Ok(StartedScan { record, handle })
            }
            _ => Err(DeploymentError::NotRunning {
                id,
                state: record.state,
            }),
        }
    }

    /// Move the scan to ERROR, keeping the caller's error as the one returned.
    async fn record_failure(&self, id: ScanId, stage: FailureStage, message: String) {
        if let Err(e) = self.lifecycle.fail(id, stage, message).await {
            error!(scan_id = %id, "Cannot record scan failure: {}", e);
        }
    }

    async fn deploy(&self, deployment: &mut Deployment) -> Result<(), DeploymentError> {
        let definition = Arc::clone(&deployment.definition);
        for (index, agent) in definition.agents.iter().enumerate() {
            let spec = self.service_spec(agent, index, deployment.handle)?;
            let service = self
                .bounded("create service", self.backend.create_service(&spec))
                .await?;
            debug!(scan_id = %deployment.handle.scan_id, agent = %agent.key, %service, "Service created");
            deployment.services.push((agent.key.clone(), service));
        }
        self.wait_healthy(&deployment.services).await
    }

    async fn wait_healthy(&self, services: &[(String, ServiceId)]) -> Result<(), DeploymentError> {
        let timeout = self.config.timeouts.deploy_health;
        match tokio::time::timeout(timeout, self.poll_health(services)).await {
            Ok(result) => result,
            Err(_) => Err(DeploymentError::Timeout {
                operation: "waiting for healthy agent services".to_string(),
                after: timeout,
            }),
        }
    }

    async fn poll_health(&self, services: &[(String, ServiceId)]) -> Result<(), DeploymentError> {
        let mut pending: Vec<&(String, ServiceId)> = services.iter().collect();
        while !pending.is_empty() {
            let mut still_pending = Vec::new();
            for entry in pending {
                let (agent_key, service) = entry;
                match self
                    .bounded("service health", self.backend.service_health(service))
                    .await?
                {
                    ServiceHealth::Running => {}
                    ServiceHealth::Pending => still_pending.push(entry),
                    ServiceHealth::Failed(reason) => {
                        return Err(DeploymentError::Unhealthy {
                            agent_key: agent_key.clone(),
                            reason,
                        })
                    }
                }
            }
            pending = still_pending;
            if !pending.is_empty() {
                tokio::time::sleep(self.config.timeouts.health_poll).await;
            }
        }
        Ok(())
    }

    fn service_spec(
        &self,
        agent: &AgentSettings,
        index: usize,
        handle: DeploymentHandle,
    ) -> Result<ServiceSpec, DeploymentError> {
        let backend = &self.config.backend;
        let image = agent.image(backend.registry_prefix.as_deref())?;

        let mut env = backend.agent_env.clone();
        env.insert(agent_env::AGENT_KEY.to_string(), agent.key.clone());
        if let Some(version) = &agent.version {
            env.insert(agent_env::AGENT_VERSION.to_string(), version.clone());
        }
        env.insert(agent_env::SCAN_SCOPE.to_string(), handle.scope.to_string());
        env.insert(agent_env::BUS_URL.to_string(), self.config.bus.url.clone());
        if let Some(url) = &self.config.tracing.collector_url {
            env.insert(agent_env::TRACING_URL.to_string(), url.clone());
        }
        env.insert(agent_env::IN_SELECTORS.to_string(), agent.in_selectors.join(","));
        env.insert(agent_env::OUT_SELECTORS.to_string(), agent.out_selectors.join(","));
        env.insert(agent_env::AGENT_ARGS.to_string(), serde_json::to_string(&agent.args)?);
        env.insert(
            agent_env::IDLE_TIMEOUT.to_string(),
            humantime::format_duration(self.config.timeouts.agent_idle).to_string(),
        );

        let labels = HashMap::from([
            ("vigil.scan_id".to_string(), handle.scan_id.to_string()),
            ("vigil.scope".to_string(), handle.scope.to_string()),
            ("vigil.agent_key".to_string(), agent.key.clone()),
        ]);

        Ok(ServiceSpec {
            name: service_name(handle.scan_id, index, &agent.key),
            image,
            env,
            labels,
            network: backend.network.clone(),
            resources: backend.resources(),
            stop_grace_period: self.config.timeouts.stop_grace_period,
        })
    }

    async fn inject_assets(
        &self,
        id: ScanId,
        scope: ScanScope,
        assets: &[Asset],
    ) -> Result<(), DeploymentError> {
        let messages: Vec<_> = assets.iter().flat_map(Asset::messages).collect();
        let candidates: Vec<AssetId> = messages.iter().map(|(_, m)| m.asset_id.clone()).collect();
        let mut accepted: HashSet<AssetId> = self
            .lifecycle
            .enqueue_assets(id, candidates)
            .await?
            .into_iter()
            .collect();

        for (path, message) in messages {
            if !accepted.remove(&message.asset_id) {
                debug!(scan_id = %id, asset = %message.asset_id, "Asset already enqueued");
                continue;
            }
            let selector = selector::build(path, scope)?;
            let payload = serde_json::to_vec(&message)?;
            self.publish(MessageEnvelope::new(selector, payload)).await?;
            metrics::counter!("vigil_assets_enqueued_total").increment(1);
        }
        Ok(())
    }

    async fn publish(&self, envelope: MessageEnvelope) -> Result<(), DeploymentError> {
        let timeout = self.config.timeouts.backend_call;
        match tokio::time::timeout(timeout, self.bus.publish(envelope)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(DeploymentError::Timeout {
                operation: "bus publish".to_string(),
                after: timeout,
            }),
        }
    }

    /// Ask every agent of the scan to shut down and mark it STOPPED. Stopping
    /// a scan that is not running returns its record unchanged.
    pub async fn stop(&self, id: ScanId) -> Result<ScanRecord, DeploymentError> {
        let Some(slot) = self.slots.get(&id).map(|s| s.value().clone()) else {
            return self
                .lifecycle
                .record(id)
                .await
                .ok_or(DeploymentError::UnknownScan(id));
        };
        let slot = slot.lock().await;
        let record = self
            .lifecycle
            .record(id)
            .await
            .ok_or(DeploymentError::UnknownScan(id))?;
        if record.state != ScanState::InProgress {
            return Ok(record);
        }

        if let Some(deployment) = &slot.deployment {
            let cancel = CancelRequest {
                reason: "scan stopped".to_string(),
            };
            let envelope = selector::build(well_known::CONTROL_CANCEL, deployment.handle.scope)
                .map_err(DeploymentError::from)
                .and_then(|selector| Ok(MessageEnvelope::new(selector, cancel.encode()?)));
            match envelope {
                Ok(envelope) => {
                    if let Err(e) = self.publish(envelope).await {
                        warn!(scan_id = %id, "Cancel request not delivered: {}", e);
                    }
                }
                Err(e) => warn!(scan_id = %id, "Cannot build cancel request: {}", e),
            }
        }

        let record = self
            .lifecycle
            .transition_from(id, ScanState::InProgress, ScanState::Stopped, None)
            .await?;
        info!(scan_id = %id, state = %record.state, "Scan stop requested");
        Ok(record)
    }

    /// Remove every service of the scan and release its scope. Safe to call
    /// any number of times. Finished and deleted scans also lose their slot.
    pub async fn teardown(&self, id: ScanId) -> Result<(), DeploymentError> {
        let Some(slot_ref) = self.slots.get(&id).map(|s| s.value().clone()) else {
            return Ok(());
        };
        let mut slot = slot_ref.lock().await;
        if let Some(deployment) = slot.deployment.as_mut() {
            self.release(deployment).await;
        }
        let finished = self
            .lifecycle
            .state(id)
            .await
            .is_none_or(|state| state.is_terminal());
        if finished {
            self.discard_slot(id, &slot_ref);
            debug!(scan_id = %id, "Deployment slot released");
        }
        Ok(())
    }

    /// Tear down every deployment still holding resources.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let ids: Vec<ScanId> = self.slots.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Err(e) = self.teardown(id).await {
                error!(scan_id = %id, "Teardown during shutdown failed: {}", e);
            }
        }
    }

    async fn release(&self, deployment: &mut Deployment) {
        if deployment.released {
            return;
        }
        let id = deployment.handle.scan_id;
        for (agent_key, service) in &deployment.services {
            match self
                .bounded("remove service", self.backend.remove_service(service))
                .await
            {
                Ok(()) | Err(DeploymentError::Backend(RuntimeError::ServiceNotFound(_))) => {}
                Err(e) => warn!(scan_id = %id, agent = %agent_key, "Failed to remove service {}: {}", service, e),
            }
        }
        let scope = deployment.handle.scope;
        let timeout = self.config.timeouts.backend_call;
        match tokio::time::timeout(timeout, self.bus.release_scope(scope)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(scan_id = %id, "Failed to release scope {}: {}", scope, e),
            Err(_) => warn!(scan_id = %id, "Releasing scope {} timed out", scope),
        }
        self.namespaces.remove(&scope);
        deployment.released = true;
        info!(scan_id = %id, services = deployment.services.len(), "Deployment torn down");
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        call: impl Future<Output = Result<T, RuntimeError>>,
    ) -> Result<T, DeploymentError> {
        let timeout = self.config.timeouts.backend_call;
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(DeploymentError::Timeout {
                operation: operation.to_string(),
                after: timeout,
            }),
        }
    }

    fn spawn_reaper(orchestrator: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(orchestrator);
        let mut events = orchestrator.lifecycle.subscribe_events();
        let shutdown = orchestrator.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                let Some(this) = weak.upgrade() else {
                    break;
                };
                match event {
                    Ok(ScanEvent::StateChanged { scan_id, to, .. }) => this.schedule_teardown(scan_id, to),
                    Ok(_) => {}
                    Err(EventBusError::Lagged(_)) => this.sweep().await,
                    Err(EventBusError::Closed) => break,
                    Err(EventBusError::Empty) => {}
                }
            }
            debug!("Deployment reaper stopped");
        });
    }

    fn schedule_teardown(self: &Arc<Self>, id: ScanId, state: ScanState) {
        let delay = match state {
            ScanState::Done | ScanState::Error => Duration::ZERO,
            ScanState::Stopped => self.config.timeouts.stop_grace_period,
            _ => return,
        };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Err(e) = this.teardown(id).await {
                error!(scan_id = %id, "Teardown failed: {}", e);
            }
        });
    }

    /// Catch up after missed events: tear down every terminal scan.
    async fn sweep(self: &Arc<Self>) {
        let ids: Vec<ScanId> = self.slots.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some(state) = self.lifecycle.state(id).await {
                if state.is_terminal() {
                    self.schedule_teardown(id, state);
                }
            }
        }
    }
}

/// Backend service name: `vigil-<scan>-<index>-<agent>`, restricted to
/// `[a-z0-9-]` and 63 characters.
fn service_name(id: ScanId, index: usize, agent_key: &str) -> String {
    let slug: String = agent_key
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let mut name = format!("vigil-{}-{}-{}", id, index, slug);
    name.truncate(SERVICE_NAME_MAX);
    name.trim_end_matches('-').to_string()
}
