// Copyright (c) 2026 Vigil Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Receive loop of an agent process.
//!
//! The runner subscribes to the agent's scoped in-selectors plus the scan's
//! cancel selector and feeds every message to the processor, one at a time,
//! in arrival order. It stops when:
//! - the orchestrator sends a cancel request
//! - the bus releases the scan scope
//! - the inbox stays idle for the configured idle timeout after the first
//!   delivery (the agent then reports completion)
//! - [`AgentRunner::shutdown_token`] is cancelled

use crate::agent::{BusAgent, MessageHandler};
use crate::settings::AgentProcessSettings;
use anyhow::Context;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vigil_core::domain::bus::{MessageBus, Subscription};
use vigil_core::domain::message::{AgentError, Delivery, MessageEnvelope, MessageProcessor};
use vigil_core::domain::report::{AgentCompleted, ScanReport};
use vigil_core::domain::selector::{well_known, ScanScope, Selector, SelectorPattern};
use vigil_core::infrastructure::telemetry::{Traced, TracingContext};
use vigil_core::infrastructure::connect_bus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Cancelled,
    Idle,
    Released,
    Shutdown,
}

pub struct AgentRunner<P> {
    processor: P,
    bus: Arc<dyn MessageBus>,
    scope: ScanScope,
    in_patterns: Vec<SelectorPattern>,
    idle_timeout: Option<Duration>,
    tracing: Option<Arc<TracingContext>>,
    shutdown: CancellationToken,
}

impl<H: MessageHandler> AgentRunner<Traced<BusAgent<H>>> {
    /// Connect to the bus and tracing collector named in `settings` and wrap
    /// `handler` into a traced, scoped agent.
    pub async fn from_settings(settings: &AgentProcessSettings, handler: H) -> anyhow::Result<Self> {
        let bus = connect_bus(&settings.bus_url)
            .await
            .with_context(|| format!("Failed to connect to bus at {}", settings.bus_url))?;
        let tracing = TracingContext::from_url(settings.tracing_url.as_deref(), &settings.key)
            .context("Failed to set up tracing")?;
        let agent = BusAgent::new(
            settings.key.clone(),
            settings.scope,
            settings.out_selectors()?,
            Arc::clone(&bus),
            handler,
        );
        let processor = Traced::new(agent, tracing.clone());
        Ok(Self::new(processor, bus, settings.scope, settings.in_patterns()?).with_tracing(tracing))
    }
}

impl<P: MessageProcessor> AgentRunner<P> {
    pub fn new(
        processor: P,
        bus: Arc<dyn MessageBus>,
        scope: ScanScope,
        in_patterns: Vec<SelectorPattern>,
    ) -> Self {
        Self {
            processor,
            bus,
            scope,
            in_patterns,
            idle_timeout: None,
            tracing: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Report completion and stop once no message arrived for `timeout`. The
    /// clock only runs after the first delivery, so a slow first publish
    /// never ends the agent early.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn with_tracing(mut self, tracing: Option<Arc<TracingContext>>) -> Self {
        self.tracing = tracing;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }

    pub async fn run(self) -> Result<RunOutcome, AgentError> {
        let cancel = SelectorPattern::exact(
            &Selector::parse(well_known::CONTROL_CANCEL)
                .map_err(|e| AgentError::handler(e.to_string()))?
                .with_scope(self.scope),
        );
        let mut patterns = self.in_patterns.clone();
        patterns.push(cancel);
        let mut inbox = self.bus.subscribe(patterns).await?;
        info!(
            agent = %self.processor.agent_name(),
            scope = %self.scope,
            "Agent listening on {} selector patterns",
            self.in_patterns.len()
        );

        let mut idle_timeout = None;
        let outcome = loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break RunOutcome::Shutdown,
                next = next_message(&mut inbox, idle_timeout) => next,
            };
            let envelope = match next {
                Next::Message(envelope) => envelope,
                Next::Closed => break RunOutcome::Released,
                Next::Idle => break RunOutcome::Idle,
            };
            if envelope.selector().path() == well_known::CONTROL_CANCEL {
                info!(agent = %self.processor.agent_name(), "Cancel requested by orchestrator");
                break RunOutcome::Cancelled;
            }
            self.dispatch(&envelope).await;
            idle_timeout = self.idle_timeout;
        };

        if outcome == RunOutcome::Idle {
            self.report_completed().await;
        }
        if let Some(tracing) = &self.tracing {
            tracing.flush();
        }
        info!(agent = %self.processor.agent_name(), ?outcome, "Agent stopped");
        Ok(outcome)
    }

    async fn dispatch(&self, envelope: &MessageEnvelope) {
        let delivery = Delivery::new(envelope, &self.processor);
        match self.processor.process(delivery).await {
            Ok(()) => debug!(selector = %envelope.selector(), "Message processed"),
            Err(e) => warn!(
                agent = %self.processor.agent_name(),
                selector = %envelope.selector(),
                "Message handler failed: {}",
                e
            ),
        }
    }

    async fn report_completed(&self) {
        let report = ScanReport::AgentCompleted(AgentCompleted {
            agent_key: self.processor.agent_name().to_string(),
        });
        let sent = match (Selector::parse(report.selector_path()), report.encode()) {
            (Ok(selector), Ok(payload)) => self.emit(selector, payload).await,
            (Err(e), _) => Err(AgentError::handler(e.to_string())),
            (_, Err(e)) => Err(AgentError::handler(e.to_string())),
        };
        if let Err(e) = sent {
            warn!(agent = %self.processor.agent_name(), "Failed to report completion: {}", e);
        }
    }

    async fn emit(&self, selector: Selector, payload: Bytes) -> Result<(), AgentError> {
        self.processor.emit(None, selector, payload).await
    }
}

enum Next {
    Message(MessageEnvelope),
    Closed,
    Idle,
}

async fn next_message(inbox: &mut Subscription, idle: Option<Duration>) -> Next {
    let recv = async {
        match inbox.recv().await {
            Some(envelope) => Next::Message(envelope),
            None => Next::Closed,
        }
    };
    match idle {
        Some(timeout) => tokio::time::timeout(timeout, recv)
            .await
            .unwrap_or(Next::Idle),
        None => recv.await,
    }
}
