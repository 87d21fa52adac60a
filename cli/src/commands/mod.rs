// Copyright (c) 2026 Vigil Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the vigil CLI

pub mod config;
pub mod group;
pub mod scan;

pub use self::config::ConfigCommand;
pub use self::group::GroupCommand;
pub use self::scan::ScanCommand;
