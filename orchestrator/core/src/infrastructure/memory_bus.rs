// Copyright (c) 2026 Vigil Contributors
// SPDX-License-Identifier: AGPL-3.0
//! In-process [`MessageBus`]: one unbounded queue per subscriber, fan-out
//! under a single lock so every subscriber observes publishes in the same
//! order they were made.

use crate::domain::bus::{BusError, MessageBus, Subscription};
use crate::domain::message::MessageEnvelope;
use crate::domain::selector::{ScanScope, SelectorPattern};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

struct Subscriber {
    patterns: Vec<SelectorPattern>,
    sender: mpsc::UnboundedSender<MessageEnvelope>,
}

impl Subscriber {
    fn wants(&self, envelope: &MessageEnvelope) -> bool {
        self.patterns.iter().any(|p| p.matches(envelope.selector()))
    }

    fn bound_to(&self, scope: ScanScope) -> bool {
        self.patterns.iter().any(|p| p.scope() == Some(scope))
    }
}

#[derive(Default)]
pub struct InMemoryBus {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, envelope: MessageEnvelope) -> Result<(), BusError> {
        let mut subscribers = self.subscribers.lock();
        let mut delivered = 0usize;
        subscribers.retain(|sub| {
            if !sub.wants(&envelope) {
                return !sub.sender.is_closed();
            }
            match sub.sender.send(envelope.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });
        metrics::counter!("vigil_messages_published_total").increment(1);
        debug!(selector = %envelope.selector(), delivered, "Published message");
        Ok(())
    }

    async fn subscribe(&self, patterns: Vec<SelectorPattern>) -> Result<Subscription, BusError> {
        if patterns.is_empty() {
            return Err(BusError::Subscribe("no selector patterns given".to_string()));
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.lock().push(Subscriber { patterns, sender });
        Ok(Subscription::new(receiver))
    }

    async fn release_scope(&self, scope: ScanScope) -> Result<(), BusError> {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|sub| !sub.bound_to(scope));
        debug!(%scope, released = before - subscribers.len(), "Released bus scope");
        Ok(())
    }
}
