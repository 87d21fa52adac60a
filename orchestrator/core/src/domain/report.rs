// Copyright (c) 2026 Vigil Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Core-owned payloads on the reserved `v3.report.*` and `v3.control.*`
//! selectors. Everything else on the bus is opaque to the orchestrator.

use crate::domain::asset::AssetId;
use crate::domain::scan::RiskRating;
use crate::domain::selector::{well_known, Selector};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VulnerabilityReport {
    pub risk_rating: RiskRating,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub technical_detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetCompleted {
    pub asset_id: AssetId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCompleted {
    pub agent_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentFault {
    pub agent_key: String,
    pub reason: String,
}

/// Graceful shutdown request sent to every agent of a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub reason: String,
}

impl CancelRequest {
    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// Messages agents send back to the scan lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanReport {
    Vulnerability(VulnerabilityReport),
    Status(StatusReport),
    AssetCompleted(AssetCompleted),
    AgentCompleted(AgentCompleted),
    Fault(AgentFault),
}

impl ScanReport {
    /// Unscoped selector path this report travels on.
    pub fn selector_path(&self) -> &'static str {
        match self {
            ScanReport::Vulnerability(_) => well_known::REPORT_VULNERABILITY,
            ScanReport::Status(_) => well_known::REPORT_STATUS,
            ScanReport::AssetCompleted(_) => well_known::REPORT_ASSET_COMPLETED,
            ScanReport::AgentCompleted(_) => well_known::REPORT_AGENT_COMPLETED,
            ScanReport::Fault(_) => well_known::REPORT_FAULT,
        }
    }

    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        let bytes = match self {
            ScanReport::Vulnerability(r) => serde_json::to_vec(r)?,
            ScanReport::Status(r) => serde_json::to_vec(r)?,
            ScanReport::AssetCompleted(r) => serde_json::to_vec(r)?,
            ScanReport::AgentCompleted(r) => serde_json::to_vec(r)?,
            ScanReport::Fault(r) => serde_json::to_vec(r)?,
        };
        Ok(Bytes::from(bytes))
    }

    /// Decode a report received on `selector`. `Ok(None)` for selectors that
    /// are not report selectors.
    pub fn decode(selector: &Selector, payload: &[u8]) -> Result<Option<Self>, serde_json::Error> {
        let report = match selector.path() {
            well_known::REPORT_VULNERABILITY => {
                ScanReport::Vulnerability(serde_json::from_slice(payload)?)
            }
            well_known::REPORT_STATUS => ScanReport::Status(serde_json::from_slice(payload)?),
            well_known::REPORT_ASSET_COMPLETED => {
                ScanReport::AssetCompleted(serde_json::from_slice(payload)?)
            }
            well_known::REPORT_AGENT_COMPLETED => {
                ScanReport::AgentCompleted(serde_json::from_slice(payload)?)
            }
            well_known::REPORT_FAULT => ScanReport::Fault(serde_json::from_slice(payload)?),
            _ => return Ok(None),
        };
        Ok(Some(report))
    }
}
