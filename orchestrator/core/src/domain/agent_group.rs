// Copyright (c) 2026 Vigil Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Group Definition
//!
//! Static description of a scan pipeline: which agents run, with which typed
//! arguments, and which selectors each consumes and produces. Pure values, no
//! I/O. A definition is snapshotted (cloned behind an `Arc`) when a scan
//! starts, so later edits never reach a running scan.
//!
//! Definitions are usually authored as YAML:
//!
//! ```yaml
//! kind: AgentGroup
//! name: web-recon
//! description: Crawl and fingerprint
//! agents:
//!   - key: agent/acme/crawler:1.2.0
//!     in_selectors: [v3.asset.link]
//!     out_selectors: [v3.asset.link]
//!     args:
//!       - name: depth
//!         type: number
//!         value: 3
//! ```

use crate::domain::selector::{Selector, SelectorError, SelectorPattern};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use thiserror::Error;

pub const AGENT_GROUP_KIND: &str = "AgentGroup";
const DEFAULT_IMAGE_TAG: &str = "latest";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Agent group must contain at least one agent")]
    EmptyAgentList,

    #[error("Agent '{agent}' declares argument '{name}' more than once")]
    DuplicateArgument { agent: String, name: String },

    #[error("Invalid agent key '{key}': {reason}")]
    InvalidAgentKey { key: String, reason: String },

    #[error("Agent '{agent}' has invalid selector '{selector}': {source}")]
    InvalidSelector {
        agent: String,
        selector: String,
        source: SelectorError,
    },

    #[error("Argument '{name}' expects a {expected} value")]
    ArgumentType { name: String, expected: ArgumentType },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgumentType {
    String,
    Number,
    Boolean,
    Binary,
}

impl fmt::Display for ArgumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArgumentType::String => "string",
            ArgumentType::Number => "number",
            ArgumentType::Boolean => "boolean",
            ArgumentType::Binary => "binary",
        };
        f.write_str(name)
    }
}

/// Typed agent argument. `value` holds JSON bytes for scalar types and the raw
/// bytes for `binary`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentArgument {
    pub name: String,
    #[serde(rename = "type")]
    pub arg_type: ArgumentType,
    pub value: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl AgentArgument {
    pub fn build(
        name: impl Into<String>,
        arg_type: ArgumentType,
        value: &serde_json::Value,
        description: Option<String>,
    ) -> Result<Self, ValidationError> {
        let name = name.into();
        let type_error = || ValidationError::ArgumentType {
            name: name.clone(),
            expected: arg_type,
        };

        let bytes = match (arg_type, value) {
            (ArgumentType::String, serde_json::Value::String(_))
            | (ArgumentType::Number, serde_json::Value::Number(_))
            | (ArgumentType::Boolean, serde_json::Value::Bool(_)) => {
                serde_json::to_vec(value).map_err(|_| type_error())?
            }
            (ArgumentType::Binary, serde_json::Value::String(s)) => s.as_bytes().to_vec(),
            (ArgumentType::Binary, serde_json::Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_u64()
                        .and_then(|b| u8::try_from(b).ok())
                        .ok_or_else(type_error)
                })
                .collect::<Result<Vec<u8>, _>>()?,
            _ => return Err(type_error()),
        };

        Ok(Self {
            name,
            arg_type,
            value: bytes,
            description,
        })
    }
}

/// One agent of a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSettings {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub args: Vec<AgentArgument>,
    /// Selector patterns the agent subscribes to (unscoped).
    #[serde(default)]
    pub in_selectors: Vec<String>,
    /// Selectors the agent may emit on (unscoped).
    #[serde(default)]
    pub out_selectors: Vec<String>,
}

impl AgentSettings {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            version: None,
            args: Vec::new(),
            in_selectors: Vec::new(),
            out_selectors: Vec::new(),
        }
    }

    /// Split `key[:version]` into a bare key and optional version.
    pub fn from_key_spec(spec: &str) -> Self {
        let (key, version) = split_key_version(spec);
        Self {
            version: version.map(str::to_string),
            ..Self::new(key)
        }
    }

    pub fn with_arg(mut self, arg: AgentArgument) -> Self {
        self.args.push(arg);
        self
    }

    pub fn with_in_selectors<I, S>(mut self, selectors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.in_selectors = selectors.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_out_selectors<I, S>(mut self, selectors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.out_selectors = selectors.into_iter().map(Into::into).collect();
        self
    }

    pub fn in_patterns(&self) -> Result<Vec<SelectorPattern>, SelectorError> {
        self.in_selectors.iter().map(|s| SelectorPattern::parse(s)).collect()
    }

    pub fn out_selectors(&self) -> Result<Vec<Selector>, SelectorError> {
        self.out_selectors.iter().map(|s| Selector::parse(s)).collect()
    }

    pub fn image(&self, registry_prefix: Option<&str>) -> Result<ImageReference, ValidationError> {
        ImageReference::for_agent(&self.key, self.version.as_deref(), registry_prefix)
    }

    fn validate_into(&self, errors: &mut Vec<ValidationError>) {
        if let Err(reason) = check_key(&self.key) {
            errors.push(ValidationError::InvalidAgentKey {
                key: self.key.clone(),
                reason,
            });
        }

        let mut seen = HashSet::new();
        for arg in &self.args {
            if !seen.insert(arg.name.as_str()) {
                errors.push(ValidationError::DuplicateArgument {
                    agent: self.key.clone(),
                    name: arg.name.clone(),
                });
            }
        }

        let in_errors = self
            .in_selectors
            .iter()
            .filter_map(|raw| SelectorPattern::parse(raw).err().map(|e| (raw, e)));
        let out_errors = self
            .out_selectors
            .iter()
            .filter_map(|raw| Selector::parse(raw).err().map(|e| (raw, e)));
        for (raw, source) in in_errors.chain(out_errors) {
            errors.push(ValidationError::InvalidSelector {
                agent: self.key.clone(),
                selector: raw.clone(),
                source,
            });
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentGroupDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub agents: Vec<AgentSettings>,
}

impl AgentGroupDefinition {
    pub fn new(name: impl Into<String>, agents: Vec<AgentSettings>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            agents,
        }
    }

    /// Every problem found, empty when the definition is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.agents.is_empty() {
            errors.push(ValidationError::EmptyAgentList);
        }
        for agent in &self.agents {
            agent.validate_into(&mut errors);
        }
        errors
    }

    pub fn agent_keys(&self) -> Vec<String> {
        self.agents.iter().map(|a| a.key.clone()).collect()
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let document: AgentGroupDocument =
            serde_yaml::from_str(yaml).context("Failed to parse agent group YAML")?;
        document.into_definition()
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read agent group file {:?}", path))?;
        Self::from_yaml_str(&content)
    }
}

/// Authoring format: argument values are plain YAML scalars.
#[derive(Debug, Deserialize)]
struct AgentGroupDocument {
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    agents: Vec<AgentDocument>,
}

#[derive(Debug, Deserialize)]
struct AgentDocument {
    key: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    args: Vec<ArgumentDocument>,
    #[serde(default)]
    in_selectors: Vec<String>,
    #[serde(default)]
    out_selectors: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ArgumentDocument {
    name: String,
    #[serde(rename = "type")]
    arg_type: ArgumentType,
    value: serde_json::Value,
    #[serde(default)]
    description: Option<String>,
}

impl AgentGroupDocument {
    fn into_definition(self) -> anyhow::Result<AgentGroupDefinition> {
        if let Some(kind) = &self.kind {
            if kind != AGENT_GROUP_KIND {
                anyhow::bail!("Invalid kind: '{}'. Must be '{}'", kind, AGENT_GROUP_KIND);
            }
        }

        let agents = self
            .agents
            .into_iter()
            .map(|doc| {
                let mut settings = AgentSettings::from_key_spec(&doc.key);
                if doc.version.is_some() {
                    settings.version = doc.version;
                }
                settings.in_selectors = doc.in_selectors;
                settings.out_selectors = doc.out_selectors;
                settings.args = doc
                    .args
                    .into_iter()
                    .map(|arg| AgentArgument::build(arg.name, arg.arg_type, &arg.value, arg.description))
                    .collect::<Result<_, _>>()?;
                Ok(settings)
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(AgentGroupDefinition {
            name: self.name.unwrap_or_default(),
            description: self.description,
            agents,
        })
    }
}

/// Container image an agent key resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    pub repository: String,
    pub tag: String,
}

impl ImageReference {
    /// `agent/<org>/<name>` maps to `[prefix/]agent_<org>_<name>:<version|latest>`.
    pub fn for_agent(
        key: &str,
        version: Option<&str>,
        registry_prefix: Option<&str>,
    ) -> Result<Self, ValidationError> {
        check_key(key).map_err(|reason| ValidationError::InvalidAgentKey {
            key: key.to_string(),
            reason,
        })?;

        let name = key.split('/').collect::<Vec<_>>().join("_");
        let repository = match registry_prefix.map(|p| p.trim_end_matches('/')) {
            Some(prefix) if !prefix.is_empty() => format!("{}/{}", prefix, name),
            _ => name,
        };
        Ok(Self {
            repository,
            tag: version.unwrap_or(DEFAULT_IMAGE_TAG).to_string(),
        })
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

fn split_key_version(spec: &str) -> (&str, Option<&str>) {
    match spec.rsplit_once(':') {
        Some((key, version)) if !version.is_empty() && !version.contains('/') => {
            (key, Some(version))
        }
        _ => (spec, None),
    }
}

fn check_key(key: &str) -> Result<(), String> {
    if key.trim().is_empty() {
        return Err("key is empty".to_string());
    }
    if key.chars().any(char::is_whitespace) {
        return Err("key contains whitespace".to_string());
    }
    if key.split('/').any(str::is_empty) {
        return Err("key contains an empty path segment".to_string());
    }
    Ok(())
}
