// Copyright (c) 2026 Vigil Contributors
// SPDX-License-Identifier: AGPL-3.0

// Orchestrator Configuration
//
// YAML configuration for the orchestration core:
// - Orchestration backend (Docker socket, overlay network, image registry)
// - Message bus transport (in-process or Redis)
// - Timeouts bounding every backend call and the deploy health wait
// - Tracing collector handed to every agent service

use crate::domain::runtime::ResourceLimits;
use crate::domain::telemetry::TracingEndpoint;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const MEMORY_BUS_URL: &str = "memory";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub tracing: TracingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Path to Docker socket
    /// Default: local defaults of the Docker client (`/var/run/docker.sock`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<String>,

    /// Overlay network agent services attach to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,

    /// Registry prepended to agent image names
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_prefix: Option<String>,

    /// Pull missing images during install
    #[serde(default = "default_true")]
    pub autopull: bool,

    /// Extra environment for every agent service
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub agent_env: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_millis: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            network: None,
            registry_prefix: None,
            autopull: true,
            agent_env: HashMap::new(),
            cpu_millis: None,
            memory_bytes: None,
        }
    }
}

impl BackendConfig {
    pub fn resources(&self) -> ResourceLimits {
        ResourceLimits {
            cpu_millis: self.cpu_millis,
            memory_bytes: self.memory_bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// `memory` or `redis://host:port`
    #[serde(default = "default_bus_url")]
    pub url: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: default_bus_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_backend_call", with = "humantime_serde")]
    pub backend_call: Duration,

    #[serde(default = "default_deploy_health", with = "humantime_serde")]
    pub deploy_health: Duration,

    #[serde(default = "default_health_poll", with = "humantime_serde")]
    pub health_poll: Duration,

    #[serde(default = "default_stop_grace_period", with = "humantime_serde")]
    pub stop_grace_period: Duration,

    /// How long an agent waits for its next message, once it has received
    /// one, before it reports itself completed
    #[serde(default = "default_agent_idle", with = "humantime_serde")]
    pub agent_idle: Duration,

    /// Overall scan timeout; a scan still running afterwards is marked DONE
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub scan: Option<Duration>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            backend_call: default_backend_call(),
            deploy_health: default_deploy_health(),
            health_poll: default_health_poll(),
            stop_grace_period: default_stop_grace_period(),
            agent_idle: default_agent_idle(),
            scan: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TracingConfig {
    /// `jaeger:<host>:<port>` or `file:<path>`. Jaeger is reached over OTLP
    /// gRPC, so use the collector's OTLP port (4317)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collector_url: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_bus_url() -> String {
    MEMORY_BUS_URL.to_string()
}

fn default_backend_call() -> Duration {
    Duration::from_secs(30)
}

fn default_deploy_health() -> Duration {
    Duration::from_secs(120)
}

fn default_agent_idle() -> Duration {
    Duration::from_secs(60)
}

fn default_health_poll() -> Duration {
    Duration::from_secs(1)
}

fn default_stop_grace_period() -> Duration {
    Duration::from_secs(30)
}

impl OrchestratorConfig {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file {:?}", path.as_ref()))?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).context("Failed to parse config YAML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml_string(&self) -> anyhow::Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize config")
    }

    /// Discover configuration file location
    ///
    /// Search order:
    /// 1. `VIGIL_CONFIG_PATH` environment variable
    /// 2. `./vigil-config.yaml`
    /// 3. `~/.vigil/config.yaml`
    /// 4. `/etc/vigil/config.yaml`
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("VIGIL_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./vigil-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".vigil").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/vigil/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Explicit path (must exist), then discovery, then defaults.
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let mut config = if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            Self::from_yaml_file(&path)
                .with_context(|| format!("Failed to load config at {:?}", path))?
        } else if let Some(path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", path);
            Self::from_yaml_file(path)?
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("VIGIL_BUS_URL") {
            tracing::info!("Environment override: VIGIL_BUS_URL={}", val);
            self.bus.url = val;
        }
        if let Ok(val) = std::env::var("VIGIL_TRACING_URL") {
            tracing::info!("Environment override: VIGIL_TRACING_URL={}", val);
            self.tracing.collector_url = Some(val).filter(|v| !v.is_empty());
        }
        if let Ok(val) = std::env::var("VIGIL_DOCKER_SOCKET") {
            tracing::info!("Environment override: VIGIL_DOCKER_SOCKET={}", val);
            self.backend.socket_path = Some(val);
        }
        if let Ok(val) = std::env::var("VIGIL_NETWORK") {
            tracing::info!("Environment override: VIGIL_NETWORK={}", val);
            self.backend.network = Some(val);
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let timeouts = [
            ("timeouts.backend_call", self.timeouts.backend_call),
            ("timeouts.deploy_health", self.timeouts.deploy_health),
            ("timeouts.health_poll", self.timeouts.health_poll),
            ("timeouts.agent_idle", self.timeouts.agent_idle),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                anyhow::bail!("{} must be greater than zero", name);
            }
        }
        if self.timeouts.scan.is_some_and(|d| d.is_zero()) {
            anyhow::bail!("timeouts.scan must be greater than zero when set");
        }

        if self.bus.url != MEMORY_BUS_URL && !self.bus.url.starts_with("redis://") {
            anyhow::bail!(
                "Unsupported bus.url '{}'. Use '{}' or 'redis://host:port'",
                self.bus.url,
                MEMORY_BUS_URL
            );
        }

        if let Some(url) = &self.tracing.collector_url {
            let endpoint = url
                .parse::<TracingEndpoint>()
                .with_context(|| format!("Invalid tracing.collector_url '{}'", url))?;
            if endpoint.targets_jaeger_agent() {
                tracing::warn!(
                    "tracing.collector_url '{}' names a Jaeger agent UDP port; use the OTLP port 4317",
                    url
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.bus.url, "memory");
        assert_eq!(config.timeouts.backend_call, Duration::from_secs(30));
        assert_eq!(config.timeouts.deploy_health, Duration::from_secs(120));
        assert_eq!(config.timeouts.agent_idle, Duration::from_secs(60));
        assert!(config.timeouts.scan.is_none());
        assert!(config.backend.autopull);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_with_humantime_durations() {
        let yaml = r#"
backend:
  network: vigil-net
  registry_prefix: registry.local:5000
bus:
  url: redis://localhost:6379
timeouts:
  backend_call: 5s
  agent_idle: 90s
  scan: 2h
tracing:
  collector_url: jaeger:localhost:4317
"#;
        let config = OrchestratorConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.backend.network.as_deref(), Some("vigil-net"));
        assert_eq!(config.timeouts.backend_call, Duration::from_secs(5));
        assert_eq!(config.timeouts.agent_idle, Duration::from_secs(90));
        assert_eq!(config.timeouts.scan, Some(Duration::from_secs(7200)));
        assert_eq!(config.timeouts.stop_grace_period, Duration::from_secs(30));
    }

    #[test]
    fn test_validation() {
        let mut config = OrchestratorConfig::default();

        config.bus.url = "amqp://localhost".to_string();
        assert!(config.validate().is_err());
        config.bus.url = "memory".to_string();

        config.tracing.collector_url = Some("zipkin:localhost:9411".to_string());
        assert!(config.validate().is_err());
        config.tracing.collector_url = Some("file:/tmp/spans.jsonl".to_string());
        assert!(config.validate().is_ok());

        config.timeouts.backend_call = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil-config.yaml");
        std::fs::write(&path, "timeouts:\n  deploy_health: 10s\n").unwrap();

        let config = OrchestratorConfig::from_yaml_file(&path).unwrap();
        assert_eq!(config.timeouts.deploy_health, Duration::from_secs(10));

        assert!(OrchestratorConfig::load_or_default(Some(dir.path().join("missing.yaml"))).is_err());
    }
}
