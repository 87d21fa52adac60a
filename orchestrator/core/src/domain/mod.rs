// Copyright (c) 2026 Vigil Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Domain layer: pure value types and the ports infrastructure implements.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Selectors, envelopes, agent groups, scans and the backend,
//!   bus and persistence ports

pub mod agent_group;
pub mod asset;
pub mod bus;
pub mod events;
pub mod message;
pub mod node_config;
pub mod report;
pub mod repository;
pub mod runtime;
pub mod scan;
pub mod selector;
pub mod telemetry;
