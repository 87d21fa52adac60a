// Copyright (c) 2026 Vigil Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Orchestration backend port: the container platform that runs one service
//! per agent. Implemented by `infrastructure::runtime::DockerSwarmBackend`.

use crate::domain::agent_group::ImageReference;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Environment handed to every agent service; read back by the agent SDK.
pub mod agent_env {
    pub const AGENT_KEY: &str = "VIGIL_AGENT_KEY";
    pub const AGENT_VERSION: &str = "VIGIL_AGENT_VERSION";
    pub const SCAN_SCOPE: &str = "VIGIL_SCAN_SCOPE";
    pub const BUS_URL: &str = "VIGIL_BUS_URL";
    pub const TRACING_URL: &str = "VIGIL_TRACING_URL";
    /// Comma separated selector patterns.
    pub const IN_SELECTORS: &str = "VIGIL_IN_SELECTORS";
    /// Comma separated selectors.
    pub const OUT_SELECTORS: &str = "VIGIL_OUT_SELECTORS";
    /// JSON array of the agent's arguments.
    pub const AGENT_ARGS: &str = "VIGIL_AGENT_ARGS";
    /// Idle timeout in humantime notation, e.g. `90s`.
    pub const IDLE_TIMEOUT: &str = "VIGIL_IDLE_TIMEOUT";
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu_millis: Option<u32>,
    pub memory_bytes: Option<u64>,
}

/// Everything needed to schedule one agent service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub image: ImageReference,
    pub env: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub network: Option<String>,
    pub resources: ResourceLimits,
    pub stop_grace_period: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceId(pub String);

impl ServiceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceHealth {
    /// Scheduled but no task running yet.
    Pending,
    Running,
    Failed(String),
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Backend unreachable: {0}")]
    Unreachable(String),
    #[error("Failed to pull image {image}: {reason}")]
    PullFailed { image: String, reason: String },
    #[error("Failed to create service: {0}")]
    ServiceCreateFailed(String),
    #[error("Service not found: {0}")]
    ServiceNotFound(String),
    #[error("Backend API error: {0}")]
    Api(String),
}

#[async_trait]
pub trait OrchestrationBackend: Send + Sync {
    /// Control API liveness.
    async fn ping(&self) -> Result<(), RuntimeError>;

    /// Whether multi-host orchestration (swarm mode) is active on this node.
    async fn cluster_active(&self) -> Result<bool, RuntimeError>;

    /// Image available locally.
    async fn image_present(&self, image: &ImageReference) -> Result<bool, RuntimeError>;

    /// Image available locally or in its registry. Never downloads.
    async fn image_resolvable(&self, image: &ImageReference) -> Result<bool, RuntimeError>;

    async fn pull_image(&self, image: &ImageReference) -> Result<(), RuntimeError>;

    async fn create_service(&self, spec: &ServiceSpec) -> Result<ServiceId, RuntimeError>;

    async fn service_health(&self, id: &ServiceId) -> Result<ServiceHealth, RuntimeError>;

    /// Graceful removal; the platform enforces the service's stop grace period.
    async fn remove_service(&self, id: &ServiceId) -> Result<(), RuntimeError>;
}
