// Copyright (c) 2026 Vigil Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Scan Aggregate
//!
//! State machine, risk ratings and the record handed back to API callers.
//!
//! ```text
//! NOT_STARTED ──start──▶ IN_PROGRESS ──all agents done / timeout──▶ DONE
//!      │                     ├──stop──▶ STOPPED
//!      └──deploy failure──▶ ERROR ◀──fault──┘
//! ```
//!
//! Only `application::lifecycle::ScanLifecycle` drives transitions; everything
//! else reads snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScanId(pub i64);

impl fmt::Display for ScanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanState {
    NotStarted,
    InProgress,
    Done,
    Stopped,
    Error,
}

impl ScanState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanState::Done | ScanState::Stopped | ScanState::Error)
    }

    pub fn can_transition_to(&self, next: ScanState) -> bool {
        matches!(
            (self, next),
            (ScanState::NotStarted, ScanState::InProgress)
                | (ScanState::NotStarted, ScanState::Error)
                | (ScanState::InProgress, ScanState::Done)
                | (ScanState::InProgress, ScanState::Stopped)
                | (ScanState::InProgress, ScanState::Error)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScanState::NotStarted => "NOT_STARTED",
            ScanState::InProgress => "IN_PROGRESS",
            ScanState::Done => "DONE",
            ScanState::Stopped => "STOPPED",
            ScanState::Error => "ERROR",
        }
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanError {
    #[error("Scan {id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        id: ScanId,
        from: ScanState,
        to: ScanState,
    },
}

/// Vulnerability severity, ordered by rank (CRITICAL highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskRating {
    Info = 0,
    Important = 1,
    Secure = 2,
    Hardening = 3,
    Potentially = 4,
    Low = 5,
    Medium = 6,
    High = 7,
    Critical = 8,
}

impl RiskRating {
    pub const ALL: [RiskRating; 9] = [
        RiskRating::Info,
        RiskRating::Important,
        RiskRating::Secure,
        RiskRating::Hardening,
        RiskRating::Potentially,
        RiskRating::Low,
        RiskRating::Medium,
        RiskRating::High,
        RiskRating::Critical,
    ];

    pub fn rank(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for RiskRating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RiskRating::Info => "INFO",
            RiskRating::Important => "IMPORTANT",
            RiskRating::Secure => "SECURE",
            RiskRating::Hardening => "HARDENING",
            RiskRating::Potentially => "POTENTIALLY",
            RiskRating::Low => "LOW",
            RiskRating::Medium => "MEDIUM",
            RiskRating::High => "HIGH",
            RiskRating::Critical => "CRITICAL",
        };
        f.write_str(name)
    }
}

/// Overall scan risk. `Unknown` until the first vulnerability arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "rating")]
pub enum AggregateRisk {
    Unknown,
    Rated(RiskRating),
}

impl AggregateRisk {
    /// Maximum by rank over the given ratings.
    pub fn from_ratings<I>(ratings: I) -> Self
    where
        I: IntoIterator<Item = RiskRating>,
    {
        ratings
            .into_iter()
            .max_by_key(RiskRating::rank)
            .map_or(AggregateRisk::Unknown, AggregateRisk::Rated)
    }
}

impl fmt::Display for AggregateRisk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregateRisk::Unknown => f.write_str("UNKNOWN"),
            AggregateRisk::Rated(rating) => rating.fmt(f),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Deployment,
    Runtime,
    Bus,
    Agent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFailure {
    pub stage: FailureStage,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub id: ScanId,
    pub title: String,
    pub state: ScanState,
    pub agent_group: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ScanFailure>,
}

impl ScanRecord {
    pub fn new(id: ScanId, title: impl Into<String>, agent_group: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            title: title.into(),
            state: ScanState::NotStarted,
            agent_group: agent_group.into(),
            created_at: now,
            updated_at: now,
            failure: None,
        }
    }
}

/// Vulnerability as persisted for a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VulnerabilityRecord {
    pub risk_rating: RiskRating,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub technical_detail: Option<String>,
    pub reported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanProgress {
    pub state: ScanState,
    pub total_assets: usize,
    pub completed_assets: usize,
    pub expected_agents: usize,
    pub completed_agents: usize,
    pub vulnerabilities: u64,
    pub risk: AggregateRisk,
}
