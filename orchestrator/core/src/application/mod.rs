// Copyright (c) 2026 Vigil Contributors
// SPDX-License-Identifier: AGPL-3.0

pub mod deployment;
pub mod error;
pub mod feasibility;
pub mod lifecycle;
pub mod scan_service;

// Re-export use cases for convenience
pub use deployment::{DeploymentHandle, DeploymentOrchestrator, StartedScan};
pub use error::{DeploymentError, ErrorKind, InstallError, InstallReport, OrchestratorError};
pub use feasibility::{FeasibilityChecker, FeasibilityError};
pub use lifecycle::ScanLifecycle;
pub use scan_service::ScanService;
