// Copyright (c) 2026 Vigil Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Pre-flight check run before any scan is deployed.
//!
//! Checks run in order and stop at the first failure:
//! 1. the agent group definition is well formed
//! 2. the orchestration backend answers
//! 3. cluster mode is active
//! 4. every agent image is resolvable (local or registry, never pulled)
//! 5. every consumed selector is produced by an asset or a sibling agent
//!
//! Results are never cached; each call observes the backend as it is now.

use crate::domain::agent_group::{AgentGroupDefinition, ValidationError};
use crate::domain::runtime::{OrchestrationBackend, RuntimeError};
use crate::domain::selector::{well_known, Selector};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum FeasibilityError {
    #[error("Invalid agent group: {}", join(.0))]
    InvalidDefinition(Vec<ValidationError>),

    #[error("Orchestration backend unreachable: {0}")]
    BackendUnreachable(String),

    #[error("Cluster mode is not active on the orchestration backend")]
    ClusterInactive,

    #[error("Image {image} of agent '{agent}' cannot be resolved")]
    ImageUnresolvable { agent: String, image: String },

    #[error("Selectors consumed but never produced: {}", .0.join(", "))]
    UncoveredSelectors(Vec<String>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Selectors produced before any agent runs.
const ENTRY_SELECTORS: [&str; 7] = [
    well_known::ASSET_IP_V4,
    well_known::ASSET_IP_V6,
    well_known::ASSET_LINK,
    well_known::ASSET_STORE_ANDROID,
    well_known::ASSET_STORE_IOS,
    well_known::ASSET_FILE_ANDROID,
    well_known::ASSET_FILE_IOS,
];

/// Reports and control messages every agent may emit without declaring them.
const IMPLICIT_SELECTORS: [&str; 6] = [
    well_known::REPORT_VULNERABILITY,
    well_known::REPORT_STATUS,
    well_known::REPORT_FAULT,
    well_known::REPORT_ASSET_COMPLETED,
    well_known::REPORT_AGENT_COMPLETED,
    well_known::CONTROL_CANCEL,
];

pub struct FeasibilityChecker {
    backend: Arc<dyn OrchestrationBackend>,
    registry_prefix: Option<String>,
    call_timeout: Duration,
}

impl FeasibilityChecker {
    pub fn new(
        backend: Arc<dyn OrchestrationBackend>,
        registry_prefix: Option<String>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            registry_prefix,
            call_timeout,
        }
    }

    pub async fn can_run(&self, definition: &AgentGroupDefinition) -> bool {
        match self.check(definition).await {
            Ok(()) => true,
            Err(e) => {
                info!(agent_group = %definition.name, "Agent group cannot run: {}", e);
                false
            }
        }
    }

    pub async fn check(&self, definition: &AgentGroupDefinition) -> Result<(), FeasibilityError> {
        let errors = definition.validate();
        if !errors.is_empty() {
            return Err(FeasibilityError::InvalidDefinition(errors));
        }

        self.bounded(self.backend.ping())
            .await
            .map_err(|e| FeasibilityError::BackendUnreachable(e.to_string()))?;

        let active = self
            .bounded(self.backend.cluster_active())
            .await
            .map_err(|e| FeasibilityError::BackendUnreachable(e.to_string()))?;
        if !active {
            return Err(FeasibilityError::ClusterInactive);
        }

        for agent in &definition.agents {
            let image = agent
                .image(self.registry_prefix.as_deref())
                .map_err(|e| FeasibilityError::InvalidDefinition(vec![e]))?;
            let resolvable = self
                .bounded(self.backend.image_resolvable(&image))
                .await
                .map_err(|e| FeasibilityError::BackendUnreachable(e.to_string()))?;
            if !resolvable {
                return Err(FeasibilityError::ImageUnresolvable {
                    agent: agent.key.clone(),
                    image: image.to_string(),
                });
            }
            debug!(agent = %agent.key, %image, "Image resolvable");
        }

        let uncovered = uncovered_selectors(definition);
        if !uncovered.is_empty() {
            return Err(FeasibilityError::UncoveredSelectors(uncovered));
        }
        Ok(())
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, RuntimeError>>,
    ) -> Result<T, RuntimeError> {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::Unreachable(format!(
                "no answer within {:?}",
                self.call_timeout
            ))),
        }
    }
}

/// In-selector patterns of the group that nothing can ever produce.
fn uncovered_selectors(definition: &AgentGroupDefinition) -> Vec<String> {
    let mut producible: Vec<Selector> = ENTRY_SELECTORS
        .iter()
        .chain(IMPLICIT_SELECTORS.iter())
        .filter_map(|raw| Selector::parse(raw).ok())
        .collect();
    for agent in &definition.agents {
        producible.extend(agent.out_selectors().unwrap_or_default());
    }

    let mut uncovered = Vec::new();
    for agent in &definition.agents {
        let Ok(patterns) = agent.in_patterns() else {
            continue;
        };
        for pattern in patterns {
            let covered = producible.iter().any(|s| pattern.matches(s));
            let label = pattern.to_string();
            if !covered && !uncovered.contains(&label) {
                uncovered.push(label);
            }
        }
    }
    uncovered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent_group::{AgentSettings, ImageReference};
    use crate::domain::runtime::{ServiceHealth, ServiceId, ServiceSpec};
    use async_trait::async_trait;
    use std::collections::HashSet;

    struct StubBackend {
        reachable: bool,
        cluster: bool,
        resolvable: HashSet<String>,
    }

    #[async_trait]
    impl OrchestrationBackend for StubBackend {
        async fn ping(&self) -> Result<(), RuntimeError> {
            if self.reachable {
                Ok(())
            } else {
                Err(RuntimeError::Unreachable("connection refused".into()))
            }
        }
        async fn cluster_active(&self) -> Result<bool, RuntimeError> {
            Ok(self.cluster)
        }
        async fn image_present(&self, _image: &ImageReference) -> Result<bool, RuntimeError> {
            Ok(false)
        }
        async fn image_resolvable(&self, image: &ImageReference) -> Result<bool, RuntimeError> {
            Ok(self.resolvable.contains(&image.to_string()))
        }
        async fn pull_image(&self, _image: &ImageReference) -> Result<(), RuntimeError> {
            panic!("feasibility must never pull");
        }
        async fn create_service(&self, _spec: &ServiceSpec) -> Result<ServiceId, RuntimeError> {
            unimplemented!()
        }
        async fn service_health(&self, _id: &ServiceId) -> Result<ServiceHealth, RuntimeError> {
            unimplemented!()
        }
        async fn remove_service(&self, _id: &ServiceId) -> Result<(), RuntimeError> {
            unimplemented!()
        }
    }

    fn checker(reachable: bool, cluster: bool, images: &[&str]) -> FeasibilityChecker {
        FeasibilityChecker::new(
            Arc::new(StubBackend {
                reachable,
                cluster,
                resolvable: images.iter().map(|s| s.to_string()).collect(),
            }),
            None,
            Duration::from_secs(1),
        )
    }

    fn group() -> AgentGroupDefinition {
        AgentGroupDefinition::new(
            "web",
            vec![
                AgentSettings::new("agent/crawler")
                    .with_in_selectors(["v3.asset.link"])
                    .with_out_selectors(["v3.asset.link.page"]),
                AgentSettings::new("agent/xss").with_in_selectors(["v3.asset.link.page"]),
            ],
        )
    }

    #[tokio::test]
    async fn test_feasible_group() {
        let checker = checker(true, true, &["agent_crawler:latest", "agent_xss:latest"]);
        assert!(checker.check(&group()).await.is_ok());
        assert!(checker.can_run(&group()).await);
    }

    #[tokio::test]
    async fn test_checks_run_in_order() {
        let unreachable = checker(false, false, &[]);
        assert!(matches!(
            unreachable.check(&group()).await,
            Err(FeasibilityError::BackendUnreachable(_))
        ));

        let no_cluster = checker(true, false, &[]);
        assert!(matches!(
            no_cluster.check(&group()).await,
            Err(FeasibilityError::ClusterInactive)
        ));

        let missing_image = checker(true, true, &["agent_crawler:latest"]);
        match missing_image.check(&group()).await {
            Err(FeasibilityError::ImageUnresolvable { agent, image }) => {
                assert_eq!(agent, "agent/xss");
                assert_eq!(image, "agent_xss:latest");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_definition_is_reported_first() {
        let checker = checker(false, false, &[]);
        let empty = AgentGroupDefinition::new("empty", vec![]);
        assert!(matches!(
            checker.check(&empty).await,
            Err(FeasibilityError::InvalidDefinition(_))
        ));
    }

    #[tokio::test]
    async fn test_uncovered_selector() {
        let definition = AgentGroupDefinition::new(
            "orphan",
            vec![AgentSettings::new("agent/xss").with_in_selectors(["v3.asset.link.page"])],
        );
        let checker = checker(true, true, &["agent_xss:latest"]);
        match checker.check(&definition).await {
            Err(FeasibilityError::UncoveredSelectors(selectors)) => {
                assert_eq!(selectors, vec!["v3.asset.link.page".to_string()]);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_wildcard_consumers_are_covered_by_assets() {
        let definition = AgentGroupDefinition::new(
            "any",
            vec![AgentSettings::new("agent/logger").with_in_selectors(["v3.asset.*"])],
        );
        assert!(uncovered_selectors(&definition).is_empty());
    }
}
