// Copyright (c) 2026 Vigil Contributors
// SPDX-License-Identifier: AGPL-3.0

pub mod event_bus;
pub mod memory_bus;
pub mod redis_bus;
pub mod repositories;
pub mod runtime;
pub mod telemetry;

pub use event_bus::EventBus;
pub use memory_bus::InMemoryBus;
pub use redis_bus::RedisBus;
pub use runtime::DockerSwarmBackend;
pub use telemetry::{Traced, TracingContext};

use crate::domain::bus::{BusError, MessageBus};
use crate::domain::node_config::MEMORY_BUS_URL;
use std::sync::Arc;

/// Open the bus named by `url`: `memory` (this process only) or
/// `redis://host:port`.
pub async fn connect_bus(url: &str) -> Result<Arc<dyn MessageBus>, BusError> {
    if url == MEMORY_BUS_URL {
        return Ok(Arc::new(InMemoryBus::new()));
    }
    if url.starts_with("redis://") {
        return Ok(Arc::new(RedisBus::connect(url).await?));
    }
    Err(BusError::UnsupportedUrl(url.to_string()))
}
