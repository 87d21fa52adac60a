// Copyright (c) 2026 Vigil Contributors
// SPDX-License-Identifier: AGPL-3.0

use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;
use vigil_core::domain::agent_group::{AgentArgument, ArgumentType};
use vigil_core::domain::runtime::agent_env;
use vigil_core::domain::selector::{ScanScope, Selector, SelectorError, SelectorPattern};

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Missing environment variable {0}")]
    Missing(&'static str),

    #[error("Invalid {name}: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("Invalid selector: {0}")]
    Selector(#[from] SelectorError),
}

/// What the orchestrator tells an agent process about itself, read from the
/// service environment.
#[derive(Debug, Clone)]
pub struct AgentProcessSettings {
    pub key: String,
    pub version: Option<String>,
    pub scope: ScanScope,
    pub bus_url: String,
    pub tracing_url: Option<String>,
    pub in_selectors: Vec<String>,
    pub out_selectors: Vec<String>,
    pub args: Vec<AgentArgument>,
    pub idle_timeout: Option<Duration>,
}

impl AgentProcessSettings {
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| {
            lookup(name)
                .filter(|v| !v.is_empty())
                .ok_or(SettingsError::Missing(name))
        };
        let list = |name: &str| -> Vec<String> {
            lookup(name)
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };

        let scope = required(agent_env::SCAN_SCOPE)?
            .parse::<ScanScope>()
            .map_err(|e| SettingsError::Invalid {
                name: agent_env::SCAN_SCOPE,
                reason: e.to_string(),
            })?;
        let args = match lookup(agent_env::AGENT_ARGS).filter(|v| !v.is_empty()) {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| SettingsError::Invalid {
                name: agent_env::AGENT_ARGS,
                reason: e.to_string(),
            })?,
            None => Vec::new(),
        };
        let idle_timeout = lookup(agent_env::IDLE_TIMEOUT)
            .filter(|v| !v.is_empty())
            .map(|raw| {
                humantime::parse_duration(&raw).map_err(|e| SettingsError::Invalid {
                    name: agent_env::IDLE_TIMEOUT,
                    reason: e.to_string(),
                })
            })
            .transpose()?
            .filter(|d| !d.is_zero());

        let settings = Self {
            key: required(agent_env::AGENT_KEY)?,
            version: lookup(agent_env::AGENT_VERSION).filter(|v| !v.is_empty()),
            scope,
            bus_url: required(agent_env::BUS_URL)?,
            tracing_url: lookup(agent_env::TRACING_URL).filter(|v| !v.is_empty()),
            in_selectors: list(agent_env::IN_SELECTORS),
            out_selectors: list(agent_env::OUT_SELECTORS),
            args,
            idle_timeout,
        };
        settings.in_patterns()?;
        settings.out_selectors()?;
        Ok(settings)
    }

    /// In-selectors bound to this agent's scan scope.
    pub fn in_patterns(&self) -> Result<Vec<SelectorPattern>, SelectorError> {
        self.in_selectors
            .iter()
            .map(|raw| SelectorPattern::parse(raw).map(|p| p.with_scope(self.scope)))
            .collect()
    }

    pub fn out_selectors(&self) -> Result<Vec<Selector>, SelectorError> {
        self.out_selectors.iter().map(|raw| Selector::parse(raw)).collect()
    }

    pub fn arg(&self, name: &str) -> Option<&AgentArgument> {
        self.args.iter().find(|a| a.name == name)
    }

    /// Decode a scalar argument. `None` when the agent has no such argument.
    pub fn arg_value<T: DeserializeOwned>(&self, name: &str) -> Option<Result<T, SettingsError>> {
        let arg = self.arg(name)?;
        if arg.arg_type == ArgumentType::Binary {
            return Some(Err(SettingsError::Invalid {
                name: agent_env::AGENT_ARGS,
                reason: format!("argument '{}' is binary", name),
            }));
        }
        Some(
            serde_json::from_slice(&arg.value).map_err(|e| SettingsError::Invalid {
                name: agent_env::AGENT_ARGS,
                reason: format!("argument '{}': {}", name, e),
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn env(scope: ScanScope) -> HashMap<&'static str, String> {
        let args = vec![
            AgentArgument::build("depth", ArgumentType::Number, &json!(3), None).unwrap(),
            AgentArgument::build("seed", ArgumentType::Binary, &json!("abc"), None).unwrap(),
        ];
        HashMap::from([
            (agent_env::AGENT_KEY, "agent/crawler".to_string()),
            (agent_env::SCAN_SCOPE, scope.to_string()),
            (agent_env::BUS_URL, "redis://bus:6379".to_string()),
            (agent_env::IN_SELECTORS, "v3.asset.link, v3.asset.ip.*".to_string()),
            (agent_env::OUT_SELECTORS, "v3.asset.link.page".to_string()),
            (agent_env::AGENT_ARGS, serde_json::to_string(&args).unwrap()),
            (agent_env::IDLE_TIMEOUT, "1m 30s".to_string()),
        ])
    }

    #[test]
    fn test_settings_from_environment() {
        let scope = ScanScope::generate();
        let vars = env(scope);
        let settings =
            AgentProcessSettings::from_lookup(|name| vars.get(name).cloned()).unwrap();

        assert_eq!(settings.key, "agent/crawler");
        assert_eq!(settings.scope, scope);
        assert!(settings.tracing_url.is_none());
        assert_eq!(settings.idle_timeout, Some(Duration::from_secs(90)));
        assert_eq!(settings.in_selectors, vec!["v3.asset.link", "v3.asset.ip.*"]);
        let patterns = settings.in_patterns().unwrap();
        assert!(patterns.iter().all(|p| p.scope() == Some(scope)));

        assert_eq!(settings.arg_value::<u32>("depth").unwrap().unwrap(), 3);
        assert!(settings.arg_value::<String>("seed").unwrap().is_err());
        assert_eq!(settings.arg("seed").unwrap().value, b"abc".to_vec());
        assert!(settings.arg_value::<u32>("missing").is_none());
    }

    #[test]
    fn test_missing_scope_is_rejected() {
        let mut vars = env(ScanScope::generate());
        vars.remove(agent_env::SCAN_SCOPE);
        let err = AgentProcessSettings::from_lookup(|name| vars.get(name).cloned()).unwrap_err();
        assert!(matches!(err, SettingsError::Missing(name) if name == agent_env::SCAN_SCOPE));
    }

    #[test]
    fn test_idle_timeout_is_optional_but_checked() {
        let mut vars = env(ScanScope::generate());
        vars.remove(agent_env::IDLE_TIMEOUT);
        let settings = AgentProcessSettings::from_lookup(|name| vars.get(name).cloned()).unwrap();
        assert!(settings.idle_timeout.is_none());

        vars.insert(agent_env::IDLE_TIMEOUT, "soon".to_string());
        let err = AgentProcessSettings::from_lookup(|name| vars.get(name).cloned()).unwrap_err();
        assert!(matches!(err, SettingsError::Invalid { name, .. } if name == agent_env::IDLE_TIMEOUT));
    }

    #[test]
    fn test_invalid_selector_is_rejected() {
        let mut vars = env(ScanScope::generate());
        vars.insert(agent_env::IN_SELECTORS, "v3..asset".to_string());
        assert!(matches!(
            AgentProcessSettings::from_lookup(|name| vars.get(name).cloned()),
            Err(SettingsError::Selector(_))
        ));
    }
}
