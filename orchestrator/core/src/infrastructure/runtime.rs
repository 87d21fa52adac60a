// Copyright (c) 2026 Vigil Contributors
// SPDX-License-Identifier: AGPL-3.0

use crate::domain::agent_group::ImageReference;
use crate::domain::runtime::{
    OrchestrationBackend, RuntimeError, ServiceHealth, ServiceId, ServiceSpec,
};
use async_trait::async_trait;
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{
    Limit, LocalNodeState, NetworkAttachmentConfig, ServiceServiceStatus,
    ServiceSpec as DockerServiceSpec, ServiceSpecMode, ServiceSpecModeReplicated, TaskSpec,
    TaskSpecContainerSpec, TaskSpecResources, TaskSpecRestartPolicy,
    TaskSpecRestartPolicyConditionEnum,
};
use bollard::service::ListServicesOptions;
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info};

/// Docker Engine in swarm mode: one replicated service (1 replica) per agent.
pub struct DockerSwarmBackend {
    docker: Docker,
}

impl DockerSwarmBackend {
    pub fn new(socket_path: Option<&str>) -> Result<Self, RuntimeError> {
        let docker = if let Some(path) = socket_path {
            #[cfg(unix)]
            let result = Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION);

            #[cfg(windows)]
            let result = Docker::connect_with_named_pipe(path, 120, bollard::API_DEFAULT_VERSION);

            result.map_err(|e| {
                RuntimeError::Unreachable(format!(
                    "Failed to connect to Docker at {}: {}\n\n\
                     Ensure Docker is running and the socket path is correct.",
                    path, e
                ))
            })?
        } else {
            Docker::connect_with_local_defaults().map_err(|e| {
                RuntimeError::Unreachable(format!(
                    "Failed to connect to Docker: {}\n\n\
                     Common causes:\n\
                     - Docker daemon not running (check: docker info)\n\
                     - Permission denied accessing Docker socket\n\
                     - Current user not in 'docker' group",
                    e
                ))
            })?
        };
        Ok(Self { docker })
    }

    fn to_docker_spec(spec: &ServiceSpec) -> DockerServiceSpec {
        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let limits = Limit {
            // 1 CPU = 1e9 nano CPUs, 1 milli CPU = 1e6 nano CPUs
            nano_cpus: spec.resources.cpu_millis.map(|m| i64::from(m) * 1_000_000),
            memory_bytes: spec
                .resources
                .memory_bytes
                .map(|b| i64::try_from(b).unwrap_or(i64::MAX)),
            ..Default::default()
        };
        let grace_nanos = i64::try_from(spec.stop_grace_period.as_nanos()).unwrap_or(i64::MAX);

        DockerServiceSpec {
            name: Some(spec.name.clone()),
            labels: Some(spec.labels.clone()),
            mode: Some(ServiceSpecMode {
                replicated: Some(ServiceSpecModeReplicated { replicas: Some(1) }),
                ..Default::default()
            }),
            task_template: Some(TaskSpec {
                container_spec: Some(TaskSpecContainerSpec {
                    image: Some(spec.image.to_string()),
                    env: Some(env),
                    labels: Some(spec.labels.clone()),
                    stop_grace_period: Some(grace_nanos),
                    ..Default::default()
                }),
                resources: Some(TaskSpecResources {
                    limits: Some(limits),
                    ..Default::default()
                }),
                // Agents run to completion; a crashed agent is reported, not restarted.
                restart_policy: Some(TaskSpecRestartPolicy {
                    condition: Some(TaskSpecRestartPolicyConditionEnum::NONE),
                    ..Default::default()
                }),
                networks: spec.network.as_ref().map(|network| {
                    vec![NetworkAttachmentConfig {
                        target: Some(network.clone()),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Running once every desired task runs. Tasks that already exited count as
/// not running, so a finished agent never passes the health wait.
fn health_from_status(status: Option<&ServiceServiceStatus>) -> ServiceHealth {
    let Some(status) = status else {
        return ServiceHealth::Pending;
    };
    match (status.running_tasks, status.desired_tasks) {
        (Some(running), Some(desired)) if desired > 0 && running >= desired => ServiceHealth::Running,
        _ => ServiceHealth::Pending,
    }
}

fn is_not_found(e: &DockerError) -> bool {
    matches!(e, DockerError::DockerResponseServerError { status_code: 404, .. })
}

#[async_trait]
impl OrchestrationBackend for DockerSwarmBackend {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker
            .ping()
            .await
            .map_err(|e| RuntimeError::Unreachable(format!("Cannot connect to Docker daemon: {}", e)))?;
        Ok(())
    }

    async fn cluster_active(&self) -> Result<bool, RuntimeError> {
        let info = self
            .docker
            .info()
            .await
            .map_err(|e| RuntimeError::Api(format!("docker info failed: {}", e)))?;
        let Some(swarm) = info.swarm else {
            return Ok(false);
        };
        Ok(swarm.local_node_state == Some(LocalNodeState::ACTIVE)
            && swarm.control_available.unwrap_or(false))
    }

    async fn image_present(&self, image: &ImageReference) -> Result<bool, RuntimeError> {
        match self.docker.inspect_image(&image.to_string()).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(RuntimeError::Api(format!("inspect image {} failed: {}", image, e))),
        }
    }

    async fn image_resolvable(&self, image: &ImageReference) -> Result<bool, RuntimeError> {
        if self.image_present(image).await? {
            return Ok(true);
        }
        match self.docker.inspect_registry_image(&image.to_string(), None).await {
            Ok(_) => Ok(true),
            Err(e) => {
                debug!(%image, "Registry lookup failed: {}", e);
                Ok(false)
            }
        }
    }

    async fn pull_image(&self, image: &ImageReference) -> Result<(), RuntimeError> {
        info!("Pulling image: {}", image);
        let options = Some(CreateImageOptions {
            from_image: image.repository.clone(),
            tag: image.tag.clone(),
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            if let Err(e) = result {
                return Err(RuntimeError::PullFailed {
                    image: image.to_string(),
                    reason: e.to_string(),
                });
            }
        }
        info!("Successfully pulled image: {}", image);
        Ok(())
    }

    async fn create_service(&self, spec: &ServiceSpec) -> Result<ServiceId, RuntimeError> {
        let response = self
            .docker
            .create_service(Self::to_docker_spec(spec), None)
            .await
            .map_err(|e| RuntimeError::ServiceCreateFailed(format!("{}: {}", spec.name, e)))?;
        let id = response
            .id
            .ok_or_else(|| RuntimeError::ServiceCreateFailed(format!("{}: no service id returned", spec.name)))?;
        info!(service = %spec.name, image = %spec.image, "Created agent service: {}", id);
        Ok(ServiceId::new(id))
    }

    async fn service_health(&self, id: &ServiceId) -> Result<ServiceHealth, RuntimeError> {
        let options = ListServicesOptions {
            filters: HashMap::from([("id".to_string(), vec![id.to_string()])]),
            status: true,
        };
        let services = self
            .docker
            .list_services(Some(options))
            .await
            .map_err(|e| RuntimeError::Api(format!("list service {} failed: {}", id, e)))?;

        let service = services
            .into_iter()
            .find(|s| s.id.as_deref() == Some(id.as_str()))
            .ok_or_else(|| RuntimeError::ServiceNotFound(id.to_string()))?;
        Ok(health_from_status(service.service_status.as_ref()))
    }

    async fn remove_service(&self, id: &ServiceId) -> Result<(), RuntimeError> {
        match self.docker.delete_service(id.as_str()).await {
            Ok(()) => {
                info!("Removed agent service: {}", id);
                Ok(())
            }
            Err(e) if is_not_found(&e) => Err(RuntimeError::ServiceNotFound(id.to_string())),
            Err(e) => Err(RuntimeError::Api(format!("delete service {} failed: {}", id, e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::runtime::ResourceLimits;
    use std::time::Duration;

    #[test]
    fn test_service_spec_translation() {
        let spec = ServiceSpec {
            name: "vigil-7-agent_demo".into(),
            image: ImageReference::for_agent("agent/demo", Some("1.0"), None).unwrap(),
            env: HashMap::from([("VIGIL_AGENT_KEY".to_string(), "agent/demo".to_string())]),
            labels: HashMap::from([("vigil.scan_id".to_string(), "7".to_string())]),
            network: Some("vigil-net".into()),
            resources: ResourceLimits {
                cpu_millis: Some(500),
                memory_bytes: Some(256 * 1024 * 1024),
            },
            stop_grace_period: Duration::from_secs(30),
        };

        let docker_spec = DockerSwarmBackend::to_docker_spec(&spec);
        let task = docker_spec.task_template.unwrap();
        let container = task.container_spec.unwrap();

        assert_eq!(container.image.as_deref(), Some("agent_demo:1.0"));
        assert_eq!(container.env.unwrap(), vec!["VIGIL_AGENT_KEY=agent/demo".to_string()]);
        assert_eq!(container.stop_grace_period, Some(30_000_000_000));
        let limits = task.resources.unwrap().limits.unwrap();
        assert_eq!(limits.nano_cpus, Some(500_000_000));
        assert_eq!(limits.memory_bytes, Some(268_435_456));
        assert_eq!(
            task.networks.unwrap()[0].target.as_deref(),
            Some("vigil-net")
        );
        assert_eq!(
            docker_spec.mode.unwrap().replicated.unwrap().replicas,
            Some(1)
        );
    }

    #[test]
    fn test_health_requires_every_desired_task_running() {
        let status = |running, desired| ServiceServiceStatus {
            running_tasks: Some(running),
            desired_tasks: Some(desired),
            completed_tasks: None,
        };

        assert_eq!(health_from_status(Some(&status(1, 1))), ServiceHealth::Running);
        assert_eq!(health_from_status(Some(&status(0, 1))), ServiceHealth::Pending);
        // An agent whose task already exited is not healthy.
        assert_eq!(health_from_status(Some(&status(0, 0))), ServiceHealth::Pending);
        assert_eq!(health_from_status(None), ServiceHealth::Pending);
    }
}
