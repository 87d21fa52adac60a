// Copyright (c) 2026 Vigil Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! In-memory adapters for the persistence ports in `domain::repository`.
//! The production scan store lives outside this crate; these back the CLI
//! and the test suites.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Persist and retrieve scan records and agent groups
//! - **Pattern:** Repository (DDD), Adapter (Hexagonal Architecture)

use crate::domain::agent_group::AgentGroupDefinition;
use crate::domain::repository::{
    AgentGroupId, AgentGroupRepository, RepositoryError, ScanRepository,
};
use crate::domain::scan::{ScanId, ScanRecord, ScanState, VulnerabilityRecord};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct ScanRow {
    record: Option<ScanRecord>,
    vulnerabilities: Vec<VulnerabilityRecord>,
    statuses: BTreeMap<String, String>,
}

#[derive(Clone, Default)]
pub struct InMemoryScanRepository {
    scans: Arc<RwLock<HashMap<ScanId, ScanRow>>>,
    next_id: Arc<AtomicI64>,
}

impl InMemoryScanRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn not_found(id: ScanId) -> RepositoryError {
        RepositoryError::NotFound(format!("scan {}", id))
    }
}

#[async_trait]
impl ScanRepository for InMemoryScanRepository {
    async fn create_scan(&self, title: &str, agent_group: &str) -> Result<ScanRecord, RepositoryError> {
        let id = ScanId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let record = ScanRecord::new(id, title, agent_group);
        self.scans.write().insert(
            id,
            ScanRow {
                record: Some(record.clone()),
                ..Default::default()
            },
        );
        Ok(record)
    }

    async fn save_scan(&self, record: &ScanRecord) -> Result<(), RepositoryError> {
        let mut scans = self.scans.write();
        let row = scans.get_mut(&record.id).ok_or_else(|| Self::not_found(record.id))?;
        row.record = Some(record.clone());
        Ok(())
    }

    async fn update_scan_state(&self, id: ScanId, state: ScanState) -> Result<(), RepositoryError> {
        let mut scans = self.scans.write();
        let record = scans
            .get_mut(&id)
            .and_then(|row| row.record.as_mut())
            .ok_or_else(|| Self::not_found(id))?;
        record.state = state;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn find_scan(&self, id: ScanId) -> Result<Option<ScanRecord>, RepositoryError> {
        Ok(self.scans.read().get(&id).and_then(|row| row.record.clone()))
    }

    async fn list_scans(&self) -> Result<Vec<ScanRecord>, RepositoryError> {
        let mut records: Vec<ScanRecord> = self
            .scans
            .read()
            .values()
            .filter_map(|row| row.record.clone())
            .collect();
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    async fn delete_scan(&self, id: ScanId) -> Result<(), RepositoryError> {
        self.scans
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Self::not_found(id))
    }

    async fn append_vulnerability(
        &self,
        id: ScanId,
        vulnerability: VulnerabilityRecord,
    ) -> Result<(), RepositoryError> {
        let mut scans = self.scans.write();
        let row = scans.get_mut(&id).ok_or_else(|| Self::not_found(id))?;
        row.vulnerabilities.push(vulnerability);
        Ok(())
    }

    async fn vulnerabilities(&self, id: ScanId) -> Result<Vec<VulnerabilityRecord>, RepositoryError> {
        self.scans
            .read()
            .get(&id)
            .map(|row| row.vulnerabilities.clone())
            .ok_or_else(|| Self::not_found(id))
    }

    async fn record_status(&self, id: ScanId, key: &str, value: &str) -> Result<(), RepositoryError> {
        let mut scans = self.scans.write();
        let row = scans.get_mut(&id).ok_or_else(|| Self::not_found(id))?;
        row.statuses.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn statuses(&self, id: ScanId) -> Result<Vec<(String, String)>, RepositoryError> {
        self.scans
            .read()
            .get(&id)
            .map(|row| row.statuses.clone().into_iter().collect())
            .ok_or_else(|| Self::not_found(id))
    }
}

#[derive(Clone, Default)]
pub struct InMemoryAgentGroupRepository {
    groups: Arc<RwLock<HashMap<AgentGroupId, AgentGroupDefinition>>>,
    next_id: Arc<AtomicI64>,
}

impl InMemoryAgentGroupRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentGroupRepository for InMemoryAgentGroupRepository {
    async fn save(&self, definition: &AgentGroupDefinition) -> Result<AgentGroupId, RepositoryError> {
        let id = AgentGroupId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.groups.write().insert(id, definition.clone());
        Ok(id)
    }

    async fn find_by_id(&self, id: AgentGroupId) -> Result<Option<AgentGroupDefinition>, RepositoryError> {
        Ok(self.groups.read().get(&id).cloned())
    }
}
