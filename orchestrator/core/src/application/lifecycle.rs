// Copyright (c) 2026 Vigil Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Scan Lifecycle
//!
//! Sole owner of scan state. Every transition is checked against
//! [`ScanState::can_transition_to`], persisted through the [`ScanRepository`]
//! and announced on the [`EventBus`].
//!
//! Once a scan starts, a watcher task consumes the scan-scoped
//! `v3.report.*` traffic and folds it into the scan: vulnerabilities feed the
//! aggregate risk, agent completions drive the scan to DONE, agent faults to
//! ERROR. The watcher ends when the bus releases the scan scope.

use crate::application::error::DeploymentError;
use crate::domain::asset::AssetId;
use crate::domain::bus::{MessageBus, Subscription};
use crate::domain::events::ScanEvent;
use crate::domain::report::ScanReport;
use crate::domain::repository::ScanRepository;
use crate::domain::scan::{
    AggregateRisk, FailureStage, RiskRating, ScanError, ScanFailure, ScanId, ScanProgress,
    ScanRecord, ScanState, VulnerabilityRecord,
};
use crate::domain::selector::{well_known, ScanScope, SelectorPattern, WILDCARD};
use crate::infrastructure::event_bus::{EventBus, EventReceiver, ScanEventReceiver};
use chrono::Utc;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
struct ScanEntry {
    record: ScanRecord,
    ratings: BTreeMap<RiskRating, u64>,
    expected_agents: BTreeSet<String>,
    completed_agents: BTreeSet<String>,
    enqueued_assets: BTreeSet<AssetId>,
    completed_assets: BTreeSet<AssetId>,
}

impl ScanEntry {
    fn new(record: ScanRecord) -> Self {
        Self {
            record,
            ratings: BTreeMap::new(),
            expected_agents: BTreeSet::new(),
            completed_agents: BTreeSet::new(),
            enqueued_assets: BTreeSet::new(),
            completed_assets: BTreeSet::new(),
        }
    }

    fn risk(&self) -> AggregateRisk {
        AggregateRisk::from_ratings(self.ratings.keys().copied())
    }

    fn all_agents_completed(&self) -> bool {
        !self.expected_agents.is_empty() && self.expected_agents.is_subset(&self.completed_agents)
    }
}

pub struct ScanLifecycle {
    repository: Arc<dyn ScanRepository>,
    bus: Arc<dyn MessageBus>,
    events: EventBus,
    scan_timeout: Option<Duration>,
    scans: DashMap<ScanId, Arc<Mutex<ScanEntry>>>,
}

impl ScanLifecycle {
    pub fn new(
        repository: Arc<dyn ScanRepository>,
        bus: Arc<dyn MessageBus>,
        events: EventBus,
        scan_timeout: Option<Duration>,
    ) -> Arc<Self> {
        Arc::new(Self {
            repository,
            bus,
            events,
            scan_timeout,
            scans: DashMap::new(),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe_events(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub fn subscribe_scan(&self, id: ScanId) -> ScanEventReceiver {
        self.events.subscribe_scan(id)
    }

    fn entry(&self, id: ScanId) -> Result<Arc<Mutex<ScanEntry>>, DeploymentError> {
        self.scans
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(DeploymentError::UnknownScan(id))
    }

    /// Register a new scan in NOT_STARTED.
    pub async fn create(&self, title: &str, agent_group: &str) -> Result<ScanRecord, DeploymentError> {
        let record = self.repository.create_scan(title, agent_group).await?;
        self.scans
            .insert(record.id, Arc::new(Mutex::new(ScanEntry::new(record.clone()))));
        info!(scan_id = %record.id, agent_group, "Created scan '{}'", title);
        Ok(record)
    }

    pub async fn record(&self, id: ScanId) -> Option<ScanRecord> {
        let entry = self.entry(id).ok()?;
        let entry = entry.lock().await;
        Some(entry.record.clone())
    }

    pub async fn state(&self, id: ScanId) -> Option<ScanState> {
        self.record(id).await.map(|r| r.state)
    }

    pub async fn risk(&self, id: ScanId) -> Option<AggregateRisk> {
        let entry = self.entry(id).ok()?;
        let entry = entry.lock().await;
        Some(entry.risk())
    }

    pub async fn progress(&self, id: ScanId) -> Option<ScanProgress> {
        let entry = self.entry(id).ok()?;
        let entry = entry.lock().await;
        Some(ScanProgress {
            state: entry.record.state,
            total_assets: entry.enqueued_assets.len(),
            completed_assets: entry.completed_assets.len(),
            expected_agents: entry.expected_agents.len(),
            completed_agents: entry.completed_agents.len(),
            vulnerabilities: entry.ratings.values().sum(),
            risk: entry.risk(),
        })
    }

    pub async fn list(&self) -> Vec<ScanRecord> {
        let entries: Vec<_> = self.scans.iter().map(|e| e.value().clone()).collect();
        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            records.push(entry.lock().await.record.clone());
        }
        records.sort_by_key(|r| r.id);
        records
    }

    /// Forget a finished scan and drop its stored record.
    pub async fn delete(&self, id: ScanId) -> Result<ScanRecord, DeploymentError> {
        let entry = self.entry(id)?;
        let entry = entry.lock().await;
        if !entry.record.state.is_terminal() {
            return Err(DeploymentError::Unfinished {
                id,
                state: entry.record.state,
            });
        }
        self.repository.delete_scan(id).await?;
        self.scans.remove(&id);
        info!(scan_id = %id, "Deleted scan");
        Ok(entry.record.clone())
    }

    /// Mark `candidates` as enqueued and return the ones not seen before for
    /// this scan, in first-occurrence order. Completed assets are never
    /// enqueued again.
    pub async fn enqueue_assets(
        &self,
        id: ScanId,
        candidates: Vec<AssetId>,
    ) -> Result<Vec<AssetId>, DeploymentError> {
        let entry = self.entry(id)?;
        let mut entry = entry.lock().await;
        let mut accepted = Vec::new();
        for asset_id in candidates {
            if entry.completed_assets.contains(&asset_id) {
                continue;
            }
            if entry.enqueued_assets.insert(asset_id.clone()) {
                accepted.push(asset_id);
            }
        }
        Ok(accepted)
    }

    pub async fn is_enqueued(&self, id: ScanId, asset_id: &AssetId) -> bool {
        match self.entry(id) {
            Ok(entry) => entry.lock().await.enqueued_assets.contains(asset_id),
            Err(_) => false,
        }
    }

    /// Unconditional transition; fails on edges the state machine forbids.
    pub async fn transition(
        &self,
        id: ScanId,
        to: ScanState,
        failure: Option<ScanFailure>,
    ) -> Result<ScanRecord, DeploymentError> {
        let entry = self.entry(id)?;
        let mut entry = entry.lock().await;
        self.apply_transition(&mut entry, to, failure).await
    }

    /// Transition only if the scan is currently in `expected`; otherwise the
    /// current record is returned untouched.
    pub async fn transition_from(
        &self,
        id: ScanId,
        expected: ScanState,
        to: ScanState,
        failure: Option<ScanFailure>,
    ) -> Result<ScanRecord, DeploymentError> {
        let entry = self.entry(id)?;
        let mut entry = entry.lock().await;
        if entry.record.state != expected {
            debug!(scan_id = %id, state = %entry.record.state, "Skipping transition to {}", to);
            return Ok(entry.record.clone());
        }
        self.apply_transition(&mut entry, to, failure).await
    }

    /// Move a non-terminal scan to ERROR. Terminal scans are left as they are.
    pub async fn fail(
        &self,
        id: ScanId,
        stage: FailureStage,
        message: impl Into<String>,
    ) -> Result<ScanRecord, DeploymentError> {
        let entry = self.entry(id)?;
        let mut entry = entry.lock().await;
        if entry.record.state.is_terminal() {
            return Ok(entry.record.clone());
        }
        let failure = ScanFailure {
            stage,
            message: message.into(),
        };
        self.apply_transition(&mut entry, ScanState::Error, Some(failure))
            .await
    }

    async fn apply_transition(
        &self,
        entry: &mut ScanEntry,
        to: ScanState,
        failure: Option<ScanFailure>,
    ) -> Result<ScanRecord, DeploymentError> {
        let from = entry.record.state;
        let id = entry.record.id;
        if !from.can_transition_to(to) {
            return Err(ScanError::InvalidTransition { id, from, to }.into());
        }

        let mut next = entry.record.clone();
        next.state = to;
        next.updated_at = Utc::now();
        if failure.is_some() {
            next.failure = failure.clone();
        }
        self.repository.save_scan(&next).await?;
        entry.record = next;

        match to {
            ScanState::InProgress => metrics::counter!("vigil_scans_started_total").increment(1),
            state if state.is_terminal() => {
                metrics::counter!("vigil_scans_finished_total", "state" => state.as_str())
                    .increment(1)
            }
            _ => {}
        }
        match &failure {
            Some(f) => warn!(scan_id = %id, "Scan {} -> {}: {}", from, to, f.message),
            None => info!(scan_id = %id, "Scan {} -> {}", from, to),
        }

        self.events.publish(ScanEvent::StateChanged {
            scan_id: id,
            from,
            to,
            failure,
            changed_at: entry.record.updated_at,
        });
        Ok(entry.record.clone())
    }

    /// Start collecting reports under `scope` and move the scan to
    /// IN_PROGRESS. The report subscription exists before the transition, so
    /// nothing an agent reports afterwards is missed.
    pub async fn begin(
        self: &Arc<Self>,
        id: ScanId,
        scope: ScanScope,
        agent_keys: Vec<String>,
    ) -> Result<ScanRecord, DeploymentError> {
        let reports = SelectorPattern::parse(&format!("{}.{}", well_known::REPORT_ROOT, WILDCARD))?
            .with_scope(scope);
        let subscription = self.bus.subscribe(vec![reports]).await?;

        let record = {
            let entry = self.entry(id)?;
            let mut entry = entry.lock().await;
            entry.expected_agents = agent_keys.into_iter().collect();
            self.apply_transition(&mut entry, ScanState::InProgress, None)
                .await?
        };

        let lifecycle = Arc::clone(self);
        tokio::spawn(async move { lifecycle.watch(id, subscription).await });
        Ok(record)
    }

    async fn watch(self: Arc<Self>, id: ScanId, mut subscription: Subscription) {
        let mut deadline = self
            .scan_timeout
            .map(|timeout| tokio::time::Instant::now() + timeout);

        loop {
            let envelope = match deadline {
                Some(at) => {
                    tokio::select! {
                        envelope = subscription.recv() => envelope,
                        _ = tokio::time::sleep_until(at) => {
                            deadline = None;
                            info!(scan_id = %id, "Scan timeout reached");
                            if let Err(e) = self
                                .transition_from(id, ScanState::InProgress, ScanState::Done, None)
                                .await
                            {
                                error!(scan_id = %id, "Failed to complete timed out scan: {}", e);
                            }
                            continue;
                        }
                    }
                }
                None => subscription.recv().await,
            };

            let Some(envelope) = envelope else {
                self.on_reports_closed(id).await;
                break;
            };

            match ScanReport::decode(envelope.selector(), envelope.payload()) {
                Ok(Some(report)) => {
                    if let Err(e) = self.apply_report(id, report).await {
                        error!(scan_id = %id, "Failed to apply report: {}", e);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(scan_id = %id, selector = %envelope.selector(), "Malformed report: {}", e)
                }
            }
        }
        debug!(scan_id = %id, "Report watcher finished");
    }

    async fn on_reports_closed(&self, id: ScanId) {
        let result = self
            .transition_from(
                id,
                ScanState::InProgress,
                ScanState::Error,
                Some(ScanFailure {
                    stage: FailureStage::Bus,
                    message: "report subscription closed while the scan was running".to_string(),
                }),
            )
            .await;
        if let Err(e) = result {
            error!(scan_id = %id, "Failed to record closed report stream: {}", e);
        }
    }

    /// Fold one agent report into the scan.
    pub async fn apply_report(&self, id: ScanId, report: ScanReport) -> Result<(), DeploymentError> {
        let entry = self.entry(id)?;
        let mut entry = entry.lock().await;

        match report {
            ScanReport::Vulnerability(vuln) => {
                let record = VulnerabilityRecord {
                    risk_rating: vuln.risk_rating,
                    title: vuln.title,
                    technical_detail: vuln.technical_detail,
                    reported_at: Utc::now(),
                };
                self.repository.append_vulnerability(id, record.clone()).await?;
                *entry.ratings.entry(record.risk_rating).or_insert(0) += 1;
                metrics::counter!(
                    "vigil_vulnerabilities_reported_total",
                    "risk_rating" => record.risk_rating.to_string()
                )
                .increment(1);
                self.events.publish(ScanEvent::VulnerabilityReported {
                    scan_id: id,
                    risk_rating: record.risk_rating,
                    title: record.title,
                    reported_at: record.reported_at,
                });
            }
            ScanReport::Status(status) => {
                self.repository
                    .record_status(id, &status.key, &status.value)
                    .await?;
            }
            ScanReport::AssetCompleted(done) => {
                if entry.completed_assets.insert(done.asset_id.clone()) {
                    self.events.publish(ScanEvent::AssetCompleted {
                        scan_id: id,
                        asset_id: done.asset_id,
                        completed_at: Utc::now(),
                    });
                }
            }
            ScanReport::AgentCompleted(done) => {
                if !entry.expected_agents.contains(&done.agent_key) {
                    warn!(scan_id = %id, "Completion from unknown agent '{}'", done.agent_key);
                    return Ok(());
                }
                if entry.completed_agents.insert(done.agent_key.clone()) {
                    self.events.publish(ScanEvent::AgentCompleted {
                        scan_id: id,
                        agent_key: done.agent_key,
                        completed_at: Utc::now(),
                    });
                }
                if entry.record.state == ScanState::InProgress && entry.all_agents_completed() {
                    self.apply_transition(&mut entry, ScanState::Done, None).await?;
                }
            }
            ScanReport::Fault(fault) => {
                if entry.record.state == ScanState::InProgress {
                    let failure = ScanFailure {
                        stage: FailureStage::Agent,
                        message: format!("agent '{}': {}", fault.agent_key, fault.reason),
                    };
                    self.apply_transition(&mut entry, ScanState::Error, Some(failure))
                        .await?;
                } else {
                    warn!(scan_id = %id, "Ignoring fault from '{}' after {}", fault.agent_key, entry.record.state);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::message::MessageEnvelope;
    use crate::domain::report::{AgentCompleted, AgentFault, VulnerabilityReport};
    use crate::domain::selector::build;
    use crate::infrastructure::memory_bus::InMemoryBus;
    use crate::infrastructure::repositories::InMemoryScanRepository;

    fn lifecycle(timeout: Option<Duration>) -> (Arc<ScanLifecycle>, Arc<InMemoryBus>, InMemoryScanRepository) {
        let repo = InMemoryScanRepository::new();
        let bus = Arc::new(InMemoryBus::new());
        let lifecycle = ScanLifecycle::new(
            Arc::new(repo.clone()),
            bus.clone(),
            EventBus::with_default_capacity(),
            timeout,
        );
        (lifecycle, bus, repo)
    }

    async fn report(bus: &InMemoryBus, scope: ScanScope, report: ScanReport) {
        let selector = build(report.selector_path(), scope).unwrap();
        bus.publish(MessageEnvelope::new(selector, report.encode().unwrap()))
            .await
            .unwrap();
    }

    async fn wait_for_state(lifecycle: &ScanLifecycle, id: ScanId, state: ScanState) {
        for _ in 0..200 {
            if lifecycle.state(id).await == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("scan {} never reached {}", id, state);
    }

    #[tokio::test]
    async fn test_transitions_are_persisted_and_checked() {
        let (lifecycle, _bus, repo) = lifecycle(None);
        let scan = lifecycle.create("scan", "group").await.unwrap();
        assert_eq!(scan.state, ScanState::NotStarted);

        assert!(matches!(
            lifecycle.transition(scan.id, ScanState::Done, None).await,
            Err(DeploymentError::Scan(ScanError::InvalidTransition { .. }))
        ));

        lifecycle
            .transition(scan.id, ScanState::InProgress, None)
            .await
            .unwrap();
        let stored = repo.find_scan(scan.id).await.unwrap().unwrap();
        assert_eq!(stored.state, ScanState::InProgress);
    }

    #[tokio::test]
    async fn test_only_finished_scans_are_deleted() {
        let (lifecycle, _bus, repo) = lifecycle(None);
        let scan = lifecycle.create("scan", "group").await.unwrap();
        lifecycle.transition(scan.id, ScanState::InProgress, None).await.unwrap();
        assert!(matches!(
            lifecycle.delete(scan.id).await,
            Err(DeploymentError::Unfinished { .. })
        ));

        lifecycle.transition(scan.id, ScanState::Stopped, None).await.unwrap();
        let deleted = lifecycle.delete(scan.id).await.unwrap();
        assert_eq!(deleted.state, ScanState::Stopped);
        assert!(lifecycle.record(scan.id).await.is_none());
        assert!(repo.find_scan(scan.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fail_is_noop_on_terminal_scan() {
        let (lifecycle, _bus, _repo) = lifecycle(None);
        let scan = lifecycle.create("scan", "group").await.unwrap();
        lifecycle.transition(scan.id, ScanState::InProgress, None).await.unwrap();
        lifecycle.transition(scan.id, ScanState::Stopped, None).await.unwrap();

        let record = lifecycle
            .fail(scan.id, FailureStage::Runtime, "late failure")
            .await
            .unwrap();
        assert_eq!(record.state, ScanState::Stopped);
        assert!(record.failure.is_none());
    }

    #[tokio::test]
    async fn test_assets_are_enqueued_once() {
        let (lifecycle, _bus, _repo) = lifecycle(None);
        let scan = lifecycle.create("scan", "group").await.unwrap();
        let a = AssetId::from("ip:10.0.0.1");
        let b = AssetId::from("ip:10.0.0.2");

        let first = lifecycle
            .enqueue_assets(scan.id, vec![a.clone(), a.clone(), b.clone()])
            .await
            .unwrap();
        assert_eq!(first, vec![a.clone(), b.clone()]);
        let second = lifecycle.enqueue_assets(scan.id, vec![a.clone()]).await.unwrap();
        assert!(second.is_empty());
        assert!(lifecycle.is_enqueued(scan.id, &b).await);
    }

    #[tokio::test]
    async fn test_reports_drive_scan_to_done() {
        let (lifecycle, bus, repo) = lifecycle(None);
        let scan = lifecycle.create("scan", "group").await.unwrap();
        let scope = ScanScope::generate();
        let mut events = lifecycle.subscribe_scan(scan.id);

        lifecycle
            .begin(scan.id, scope, vec!["agent/a".into(), "agent/b".into()])
            .await
            .unwrap();

        report(
            &bus,
            scope,
            ScanReport::Vulnerability(VulnerabilityReport {
                risk_rating: RiskRating::Medium,
                title: "Directory listing".into(),
                technical_detail: None,
            }),
        )
        .await;
        report(
            &bus,
            scope,
            ScanReport::Vulnerability(VulnerabilityReport {
                risk_rating: RiskRating::Critical,
                title: "RCE".into(),
                technical_detail: Some("unauthenticated".into()),
            }),
        )
        .await;
        for key in ["agent/a", "agent/b"] {
            report(
                &bus,
                scope,
                ScanReport::AgentCompleted(AgentCompleted {
                    agent_key: key.into(),
                }),
            )
            .await;
        }

        wait_for_state(&lifecycle, scan.id, ScanState::Done).await;
        assert_eq!(
            lifecycle.risk(scan.id).await,
            Some(AggregateRisk::Rated(RiskRating::Critical))
        );
        assert_eq!(repo.vulnerabilities(scan.id).await.unwrap().len(), 2);

        let progress = lifecycle.progress(scan.id).await.unwrap();
        assert_eq!(progress.completed_agents, 2);
        assert_eq!(progress.vulnerabilities, 2);

        let first = events.recv().await.unwrap();
        assert!(matches!(
            first,
            ScanEvent::StateChanged {
                to: ScanState::InProgress,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_agent_fault_moves_scan_to_error() {
        let (lifecycle, bus, _repo) = lifecycle(None);
        let scan = lifecycle.create("scan", "group").await.unwrap();
        let scope = ScanScope::generate();
        lifecycle.begin(scan.id, scope, vec!["agent/a".into()]).await.unwrap();

        report(
            &bus,
            scope,
            ScanReport::Fault(AgentFault {
                agent_key: "agent/a".into(),
                reason: "handler panicked".into(),
            }),
        )
        .await;

        wait_for_state(&lifecycle, scan.id, ScanState::Error).await;
        let record = lifecycle.record(scan.id).await.unwrap();
        assert_eq!(record.failure.unwrap().stage, FailureStage::Agent);
    }

    #[tokio::test]
    async fn test_reports_of_other_scopes_are_ignored() {
        let (lifecycle, bus, _repo) = lifecycle(None);
        let scan = lifecycle.create("scan", "group").await.unwrap();
        let scope = ScanScope::generate();
        lifecycle.begin(scan.id, scope, vec!["agent/a".into()]).await.unwrap();

        report(
            &bus,
            ScanScope::generate(),
            ScanReport::AgentCompleted(AgentCompleted {
                agent_key: "agent/a".into(),
            }),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(lifecycle.state(scan.id).await, Some(ScanState::InProgress));
    }

    #[tokio::test]
    async fn test_scan_timeout_completes_scan() {
        let (lifecycle, _bus, _repo) = lifecycle(Some(Duration::from_millis(30)));
        let scan = lifecycle.create("scan", "group").await.unwrap();
        lifecycle
            .begin(scan.id, ScanScope::generate(), vec!["agent/slow".into()])
            .await
            .unwrap();

        wait_for_state(&lifecycle, scan.id, ScanState::Done).await;
    }

    #[tokio::test]
    async fn test_released_scope_while_running_is_an_error() {
        let (lifecycle, bus, _repo) = lifecycle(None);
        let scan = lifecycle.create("scan", "group").await.unwrap();
        let scope = ScanScope::generate();
        lifecycle.begin(scan.id, scope, vec!["agent/a".into()]).await.unwrap();

        bus.release_scope(scope).await.unwrap();

        wait_for_state(&lifecycle, scan.id, ScanState::Error).await;
        let record = lifecycle.record(scan.id).await.unwrap();
        assert_eq!(record.failure.unwrap().stage, FailureStage::Bus);
    }
}
