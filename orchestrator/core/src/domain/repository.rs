// Copyright (c) 2026 Vigil Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Persistence Ports
//!
//! The scan store is an external collaborator; the core only needs the small
//! key-value-like surface below.
//!
//! | Trait | Records | Implementations |
//! |-------|---------|-----------------|
//! | `ScanRepository` | `ScanRecord`, vulnerabilities, status key/values | `InMemoryScanRepository` |
//! | `AgentGroupRepository` | `AgentGroupDefinition` | `InMemoryAgentGroupRepository` |

use crate::domain::agent_group::AgentGroupDefinition;
use crate::domain::scan::{ScanId, ScanRecord, ScanState, VulnerabilityRecord};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentGroupId(pub i64);

impl fmt::Display for AgentGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[async_trait]
pub trait ScanRepository: Send + Sync {
    /// Allocate an id and store the initial record.
    async fn create_scan(&self, title: &str, agent_group: &str) -> Result<ScanRecord, RepositoryError>;

    /// Overwrite the stored record (state, timestamps, failure).
    async fn save_scan(&self, record: &ScanRecord) -> Result<(), RepositoryError>;

    async fn update_scan_state(&self, id: ScanId, state: ScanState) -> Result<(), RepositoryError>;

    async fn find_scan(&self, id: ScanId) -> Result<Option<ScanRecord>, RepositoryError>;

    async fn list_scans(&self) -> Result<Vec<ScanRecord>, RepositoryError>;

    async fn delete_scan(&self, id: ScanId) -> Result<(), RepositoryError>;

    async fn append_vulnerability(
        &self,
        id: ScanId,
        vulnerability: VulnerabilityRecord,
    ) -> Result<(), RepositoryError>;

    async fn vulnerabilities(&self, id: ScanId) -> Result<Vec<VulnerabilityRecord>, RepositoryError>;

    /// Upsert one status key reported by an agent.
    async fn record_status(&self, id: ScanId, key: &str, value: &str) -> Result<(), RepositoryError>;

    async fn statuses(&self, id: ScanId) -> Result<Vec<(String, String)>, RepositoryError>;
}

#[async_trait]
pub trait AgentGroupRepository: Send + Sync {
    async fn save(&self, definition: &AgentGroupDefinition) -> Result<AgentGroupId, RepositoryError>;

    async fn find_by_id(&self, id: AgentGroupId) -> Result<Option<AgentGroupDefinition>, RepositoryError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}
