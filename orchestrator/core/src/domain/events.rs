// Copyright (c) 2026 Vigil Contributors
// SPDX-License-Identifier: AGPL-3.0

use crate::domain::asset::AssetId;
use crate::domain::scan::{RiskRating, ScanFailure, ScanId, ScanState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Scan lifecycle events, published in-process for observers (CLI progress,
/// the deployment reaper).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScanEvent {
    StateChanged {
        scan_id: ScanId,
        from: ScanState,
        to: ScanState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure: Option<ScanFailure>,
        changed_at: DateTime<Utc>,
    },
    VulnerabilityReported {
        scan_id: ScanId,
        risk_rating: RiskRating,
        title: String,
        reported_at: DateTime<Utc>,
    },
    AssetCompleted {
        scan_id: ScanId,
        asset_id: AssetId,
        completed_at: DateTime<Utc>,
    },
    AgentCompleted {
        scan_id: ScanId,
        agent_key: String,
        completed_at: DateTime<Utc>,
    },
}

impl ScanEvent {
    pub fn scan_id(&self) -> ScanId {
        match self {
            ScanEvent::StateChanged { scan_id, .. }
            | ScanEvent::VulnerabilityReported { scan_id, .. }
            | ScanEvent::AssetCompleted { scan_id, .. }
            | ScanEvent::AgentCompleted { scan_id, .. } => *scan_id,
        }
    }
}
