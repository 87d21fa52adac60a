// Copyright (c) 2026 Vigil Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Tracing endpoint configuration string.
//!
//! One string selects the single span exporter of an agent process:
//! `jaeger:<host>:<port>` or `file:<path>`. Absent means tracing is off.
//! Jaeger endpoints are spoken to over OTLP gRPC, so `<port>` is the
//! collector's OTLP port (4317), not the agent's UDP port.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TracingConfigError {
    #[error("Unknown tracing exporter '{0}'; expected 'jaeger' or 'file'")]
    UnknownExporter(String),

    #[error("Malformed tracing endpoint '{0}'")]
    Malformed(String),

    #[error("Failed to initialise tracing exporter: {0}")]
    Exporter(String),
}

/// UDP ports of the Jaeger agent (compact and binary thrift).
const JAEGER_AGENT_PORTS: [u16; 2] = [6831, 6832];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TracingEndpoint {
    Jaeger { host: String, port: u16 },
    File(PathBuf),
}

impl TracingEndpoint {
    /// True for a Jaeger agent UDP port, which never accepts OTLP.
    pub fn targets_jaeger_agent(&self) -> bool {
        matches!(self, TracingEndpoint::Jaeger { port, .. } if JAEGER_AGENT_PORTS.contains(port))
    }
}

impl FromStr for TracingEndpoint {
    type Err = TracingConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, rest) = s
            .split_once(':')
            .ok_or_else(|| TracingConfigError::Malformed(s.to_string()))?;
        match kind {
            "jaeger" => {
                let (host, port) = rest
                    .rsplit_once(':')
                    .ok_or_else(|| TracingConfigError::Malformed(s.to_string()))?;
                let port = port
                    .parse::<u16>()
                    .map_err(|_| TracingConfigError::Malformed(s.to_string()))?;
                if host.is_empty() {
                    return Err(TracingConfigError::Malformed(s.to_string()));
                }
                Ok(TracingEndpoint::Jaeger {
                    host: host.to_string(),
                    port,
                })
            }
            "file" if !rest.is_empty() => Ok(TracingEndpoint::File(PathBuf::from(rest))),
            "file" => Err(TracingConfigError::Malformed(s.to_string())),
            other => Err(TracingConfigError::UnknownExporter(other.to_string())),
        }
    }
}

impl fmt::Display for TracingEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TracingEndpoint::Jaeger { host, port } => write!(f, "jaeger:{}:{}", host, port),
            TracingEndpoint::File(path) => write!(f, "file:{}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_exporters() {
        assert_eq!(
            "jaeger:collector.local:4317".parse::<TracingEndpoint>().unwrap(),
            TracingEndpoint::Jaeger {
                host: "collector.local".into(),
                port: 4317
            }
        );
        assert_eq!(
            "file:/tmp/spans.jsonl".parse::<TracingEndpoint>().unwrap(),
            TracingEndpoint::File(PathBuf::from("/tmp/spans.jsonl"))
        );
    }

    #[test]
    fn test_jaeger_agent_port_is_detected() {
        let agent: TracingEndpoint = "jaeger:jaeger:6831".parse().unwrap();
        assert!(agent.targets_jaeger_agent());
        let collector: TracingEndpoint = "jaeger:jaeger:4317".parse().unwrap();
        assert!(!collector.targets_jaeger_agent());
        let file: TracingEndpoint = "file:/tmp/6831".parse().unwrap();
        assert!(!file.targets_jaeger_agent());
    }

    #[test]
    fn test_unknown_kind_fails_fast() {
        assert_eq!(
            "zipkin:localhost:9411".parse::<TracingEndpoint>(),
            Err(TracingConfigError::UnknownExporter("zipkin".into()))
        );
    }

    #[test]
    fn test_malformed_endpoints() {
        assert!(matches!(
            "jaeger:localhost".parse::<TracingEndpoint>(),
            Err(TracingConfigError::Malformed(_))
        ));
        assert!(matches!(
            "jaeger:localhost:notaport".parse::<TracingEndpoint>(),
            Err(TracingConfigError::Malformed(_))
        ));
        assert!(matches!(
            "file:".parse::<TracingEndpoint>(),
            Err(TracingConfigError::Malformed(_))
        ));
        assert!(matches!(
            "nothing".parse::<TracingEndpoint>(),
            Err(TracingConfigError::Malformed(_))
        ));
    }
}
