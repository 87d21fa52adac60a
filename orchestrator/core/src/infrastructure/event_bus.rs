// Copyright (c) 2026 Vigil Contributors
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for Scan Events
//
// In-process fan-out of scan lifecycle events using a tokio broadcast
// channel. Observers (CLI progress output, the deployment reaper) subscribe
// here; agent traffic goes through the MessageBus port instead.
//
// Events are not persisted: a receiver that lags past the channel capacity
// gets EventBusError::Lagged and must re-read state from the lifecycle.

use crate::domain::events::ScanEvent;
use crate::domain::scan::ScanId;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<ScanEvent>>,
}

impl EventBus {
    /// Capacity bounds how many events a slow receiver may fall behind.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish(&self, event: ScanEvent) {
        debug!(scan_id = %event.scan_id(), "Publishing scan event: {:?}", event);
        if self.sender.send(event).unwrap_or(0) == 0 {
            debug!("No subscribers listening to scan event");
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Receiver yielding only events of `scan_id`.
    pub fn subscribe_scan(&self, scan_id: ScanId) -> ScanEventReceiver {
        ScanEventReceiver {
            receiver: self.sender.subscribe(),
            scan_id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

pub struct EventReceiver {
    receiver: broadcast::Receiver<ScanEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<ScanEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    pub fn try_recv(&mut self) -> Result<ScanEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

pub struct ScanEventReceiver {
    receiver: broadcast::Receiver<ScanEvent>,
    scan_id: ScanId,
}

impl ScanEventReceiver {
    pub async fn recv(&mut self) -> Result<ScanEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if event.scan_id() == self.scan_id {
                return Ok(event);
            }
        }
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::scan::ScanState;
    use chrono::Utc;

    fn state_changed(scan_id: ScanId, to: ScanState) -> ScanEvent {
        ScanEvent::StateChanged {
            scan_id,
            from: ScanState::NotStarted,
            to,
            failure: None,
            changed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_scan_event_filtering() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe_scan(ScanId(2));

        event_bus.publish(state_changed(ScanId(1), ScanState::InProgress));
        event_bus.publish(state_changed(ScanId(2), ScanState::Error));

        match receiver.recv().await.unwrap() {
            ScanEvent::StateChanged { scan_id, to, .. } => {
                assert_eq!(scan_id, ScanId(2));
                assert_eq!(to, ScanState::Error);
            }
            other => panic!("Wrong event received: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let event_bus = EventBus::new(10);
        let mut receiver1 = event_bus.subscribe();
        let mut receiver2 = event_bus.subscribe();
        assert_eq!(event_bus.subscriber_count(), 2);

        event_bus.publish(state_changed(ScanId(7), ScanState::InProgress));

        assert_eq!(receiver1.recv().await.unwrap().scan_id(), ScanId(7));
        assert_eq!(receiver2.recv().await.unwrap().scan_id(), ScanId(7));
        assert!(matches!(receiver1.try_recv(), Err(EventBusError::Empty)));
    }

    #[tokio::test]
    async fn test_lagging_receiver_is_told() {
        let event_bus = EventBus::new(1);
        let mut receiver = event_bus.subscribe();

        event_bus.publish(state_changed(ScanId(1), ScanState::InProgress));
        event_bus.publish(state_changed(ScanId(2), ScanState::InProgress));

        assert!(matches!(receiver.recv().await, Err(EventBusError::Lagged(1))));
    }
}
