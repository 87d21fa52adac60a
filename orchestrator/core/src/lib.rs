// Copyright (c) 2026 Vigil Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Vigil core
//!
//! Runtime orchestration of agent-group security scans: feasibility checks,
//! deployment of one service per agent, scan-scoped bus addressing, the scan
//! state machine and per-message tracing.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** `domain` holds values and ports, `application` the use cases,
//!   `infrastructure` the Docker, bus, telemetry and storage adapters

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use domain::*;
