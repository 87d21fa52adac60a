// Copyright (c) 2026 Vigil Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Error types of the orchestration use cases.
//!
//! Everything below the scan state machine (backend calls, bus I/O, storage)
//! surfaces as a [`DeploymentError`]; API callers only ever see an
//! [`OrchestratorError`] and branch on its [`ErrorKind`].

use crate::application::feasibility::FeasibilityError;
use crate::domain::agent_group::ValidationError;
use crate::domain::asset::AssetError;
use crate::domain::bus::BusError;
use crate::domain::repository::RepositoryError;
use crate::domain::runtime::RuntimeError;
use crate::domain::scan::{ScanError, ScanId, ScanState};
use crate::domain::selector::SelectorError;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Per-agent install failure. Never fatal to sibling agents.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("Failed to install agent '{agent_key}' ({image}): {reason}")]
pub struct InstallError {
    pub agent_key: String,
    pub image: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallReport {
    pub installed: Vec<String>,
    pub failed: Vec<InstallError>,
}

impl InstallReport {
    pub fn failed_keys(&self) -> Vec<String> {
        self.failed.iter().map(|e| e.agent_key.clone()).collect()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum DeploymentError {
    #[error("Scan {0} not found")]
    UnknownScan(ScanId),

    #[error("Scan {id} was already started (state {state})")]
    AlreadyStarted { id: ScanId, state: ScanState },

    #[error("Scan {id} is not running (state {state})")]
    NotRunning { id: ScanId, state: ScanState },

    #[error("Scan {id} has not finished (state {state})")]
    Unfinished { id: ScanId, state: ScanState },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Invalid agent: {0}")]
    InvalidAgent(#[from] ValidationError),

    #[error("Agent '{agent_key}' failed to become healthy: {reason}")]
    Unhealthy { agent_key: String, reason: String },

    #[error("Backend call failed: {0}")]
    Backend(#[from] RuntimeError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Persistence error: {0}")]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error("Invalid selector: {0}")]
    Selector(#[from] SelectorError),

    #[error("Payload encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Caller-facing classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Infeasible,
    Invalid,
    Internal,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Agent group cannot run: {0}")]
    Infeasible(#[from] FeasibilityError),

    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error("Deployment failed: {0}")]
    Deployment(DeploymentError),

    #[error("Persistence error: {0}")]
    Repository(RepositoryError),
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::NotFound(_) => ErrorKind::NotFound,
            OrchestratorError::Infeasible(_) => ErrorKind::Infeasible,
            OrchestratorError::Invalid(_) => ErrorKind::Invalid,
            OrchestratorError::Repository(RepositoryError::NotFound(_)) => ErrorKind::NotFound,
            OrchestratorError::Deployment(_) | OrchestratorError::Repository(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Only internal failures may succeed on retry; the rest need the caller
    /// to change the request or the environment.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Internal
    }

    pub fn invalid_definition(errors: &[ValidationError]) -> Self {
        let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
        OrchestratorError::Invalid(messages.join("; "))
    }
}

impl From<DeploymentError> for OrchestratorError {
    fn from(err: DeploymentError) -> Self {
        match err {
            DeploymentError::UnknownScan(id) => OrchestratorError::NotFound(format!("scan {}", id)),
            DeploymentError::AlreadyStarted { .. }
            | DeploymentError::NotRunning { .. }
            | DeploymentError::Unfinished { .. } => OrchestratorError::Invalid(err.to_string()),
            other => OrchestratorError::Deployment(other),
        }
    }
}

impl From<RepositoryError> for OrchestratorError {
    fn from(err: RepositoryError) -> Self {
        OrchestratorError::Repository(err)
    }
}

impl From<AssetError> for OrchestratorError {
    fn from(err: AssetError) -> Self {
        OrchestratorError::Invalid(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            OrchestratorError::from(DeploymentError::UnknownScan(ScanId(3))).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            OrchestratorError::from(FeasibilityError::ClusterInactive).kind(),
            ErrorKind::Infeasible
        );
        let timeout = DeploymentError::Timeout {
            operation: "create service".into(),
            after: Duration::from_secs(1),
        };
        let internal = OrchestratorError::from(timeout);
        assert_eq!(internal.kind(), ErrorKind::Internal);
        assert!(internal.is_retryable());
        assert!(!OrchestratorError::NotFound("scan 1".into()).is_retryable());
    }

    #[test]
    fn test_install_report_keys() {
        let report = InstallReport {
            installed: vec!["agent/a".into()],
            failed: vec![InstallError {
                agent_key: "agent/b".into(),
                image: "agent_b:latest".into(),
                reason: "manifest unknown".into(),
            }],
        };
        assert_eq!(report.failed_keys(), vec!["agent/b".to_string()]);
        assert!(!report.is_complete());
    }
}
