// Copyright (c) 2026 Vigil Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Publish/subscribe port shared by the orchestrator and agent processes.
//!
//! Implementations must preserve emission order between one publisher and one
//! matching subscriber and must never drop a message for a live subscription.
//! Implemented by `infrastructure::memory_bus::InMemoryBus` and
//! `infrastructure::redis_bus::RedisBus`.

use crate::domain::message::MessageEnvelope;
use crate::domain::selector::{ScanScope, SelectorPattern};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("Bus connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Envelope codec error: {0}")]
    Codec(String),

    #[error("Unsupported bus url '{0}'")]
    UnsupportedUrl(String),
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, envelope: MessageEnvelope) -> Result<(), BusError>;

    /// Subscribe to every selector matched by any of `patterns`.
    async fn subscribe(&self, patterns: Vec<SelectorPattern>) -> Result<Subscription, BusError>;

    /// Close every subscription bound to `scope`. Safe to repeat.
    async fn release_scope(&self, scope: ScanScope) -> Result<(), BusError>;
}

/// Ordered stream of envelopes for one subscriber.
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<MessageEnvelope>,
}

impl Subscription {
    pub fn new(receiver: mpsc::UnboundedReceiver<MessageEnvelope>) -> Self {
        Self { receiver }
    }

    /// Next envelope, or `None` once the bus closed this subscription.
    pub async fn recv(&mut self) -> Option<MessageEnvelope> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<MessageEnvelope> {
        self.receiver.try_recv().ok()
    }
}
