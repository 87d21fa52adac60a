// Copyright (c) 2026 Vigil Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Redis pub/sub [`MessageBus`] for agents spread over several hosts.
//!
//! Each selector is a Redis channel carrying the framed envelope
//! (`MessageEnvelope::encode`). Subscriptions use `PSUBSCRIBE` with the glob
//! form of each pattern and re-check the exact pattern client side, since a
//! Redis `*` also matches across segment boundaries. Redis delivers messages
//! of one connection in publish order, which keeps per-publisher FIFO.

use crate::domain::bus::{BusError, MessageBus, Subscription};
use crate::domain::message::MessageEnvelope;
use crate::domain::selector::{ScanScope, Selector, SelectorPattern};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct RedisBus {
    client: redis::Client,
    connection: redis::aio::MultiplexedConnection,
    scopes: DashMap<ScanScope, CancellationToken>,
}

impl RedisBus {
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url).map_err(|e| BusError::Connection(e.to_string()))?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BusError::Connection(format!("Redis connection failed: {}", e)))?;
        Ok(Self {
            client,
            connection,
            scopes: DashMap::new(),
        })
    }

    fn scope_token(&self, patterns: &[SelectorPattern]) -> CancellationToken {
        match patterns.iter().find_map(SelectorPattern::scope) {
            Some(scope) => self.scopes.entry(scope).or_default().child_token(),
            None => CancellationToken::new(),
        }
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, envelope: MessageEnvelope) -> Result<(), BusError> {
        let frame = envelope.encode()?;
        let mut conn = self.connection.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(envelope.selector().to_string())
            .arg(frame.as_ref())
            .query_async(&mut conn)
            .await
            .map_err(|e| BusError::Publish(format!("Redis PUBLISH failed: {}", e)))?;
        metrics::counter!("vigil_messages_published_total").increment(1);
        debug!(selector = %envelope.selector(), receivers, "Published message");
        Ok(())
    }

    async fn subscribe(&self, patterns: Vec<SelectorPattern>) -> Result<Subscription, BusError> {
        if patterns.is_empty() {
            return Err(BusError::Subscribe("no selector patterns given".to_string()));
        }
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BusError::Connection(format!("Redis pubsub connection failed: {}", e)))?;
        for pattern in &patterns {
            pubsub
                .psubscribe(pattern.to_glob())
                .await
                .map_err(|e| BusError::Subscribe(format!("PSUBSCRIBE {} failed: {}", pattern, e)))?;
        }

        let token = self.scope_token(&patterns);
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            loop {
                let msg = tokio::select! {
                    _ = token.cancelled() => break,
                    msg = messages.next() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                };
                let channel = msg.get_channel_name().to_string();
                let selector = match Selector::parse(&channel) {
                    Ok(selector) => selector,
                    Err(e) => {
                        warn!(channel = %channel, "Ignoring message on invalid selector: {}", e);
                        continue;
                    }
                };
                if !patterns.iter().any(|p| p.matches(&selector)) {
                    continue;
                }
                let frame = Bytes::copy_from_slice(msg.get_payload_bytes());
                match MessageEnvelope::decode(selector, frame) {
                    Ok(envelope) => {
                        if sender.send(envelope).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(channel = %channel, "Dropping undecodable frame: {}", e),
                }
            }
            debug!("Redis subscription closed");
        });

        Ok(Subscription::new(receiver))
    }

    async fn release_scope(&self, scope: ScanScope) -> Result<(), BusError> {
        if let Some((_, token)) = self.scopes.remove(&scope) {
            token.cancel();
        }
        Ok(())
    }
}
