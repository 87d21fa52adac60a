// Copyright (c) 2026 Vigil Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Bus-bound agent: user handler plus the scope and out-selector rules every
//! agent obeys.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;
use vigil_core::domain::bus::MessageBus;
use vigil_core::domain::message::{
    AgentError, Delivery, MessageEnvelope, MessageProcessor, TraceContext,
};
use vigil_core::domain::report::{AgentFault, ScanReport};
use vigil_core::domain::selector::{well_known, ScanScope, Selector};

/// Agent logic. Emit follow-up messages through [`Delivery::emit`] with
/// unscoped selectors; the scan scope is added for you.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery<'_>) -> Result<(), AgentError>;
}

pub struct BusAgent<H> {
    name: String,
    scope: ScanScope,
    out_selectors: Vec<Selector>,
    bus: Arc<dyn MessageBus>,
    handler: H,
}

impl<H: MessageHandler> BusAgent<H> {
    pub fn new(
        name: impl Into<String>,
        scope: ScanScope,
        out_selectors: Vec<Selector>,
        bus: Arc<dyn MessageBus>,
        handler: H,
    ) -> Self {
        Self {
            name: name.into(),
            scope,
            out_selectors: out_selectors.iter().map(Selector::unscoped).collect(),
            bus,
            handler,
        }
    }

    pub fn scope(&self) -> ScanScope {
        self.scope
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    fn may_emit(&self, selector: &Selector) -> bool {
        selector.starts_with_path(well_known::REPORT_ROOT)
            || self
                .out_selectors
                .iter()
                .any(|declared| declared.path() == selector.path())
    }
}

#[async_trait]
impl<H: MessageHandler> MessageProcessor for BusAgent<H> {
    fn agent_name(&self) -> &str {
        &self.name
    }

    async fn process(&self, delivery: Delivery<'_>) -> Result<(), AgentError> {
        self.handler.handle(delivery).await
    }

    async fn emit(
        &self,
        parent: Option<&TraceContext>,
        selector: Selector,
        payload: Bytes,
    ) -> Result<(), AgentError> {
        let undeclared = || AgentError::UndeclaredSelector {
            agent: self.name.clone(),
            selector: selector.to_string(),
        };
        let scoped = match selector.scope() {
            Some(scope) if scope != self.scope => return Err(undeclared()),
            Some(_) => selector.clone(),
            None => selector.clone().with_scope(self.scope),
        };
        if !self.may_emit(&scoped) {
            return Err(undeclared());
        }
        debug!(agent = %self.name, selector = %scoped, "Emitting message");
        let envelope = MessageEnvelope::new(scoped, payload).with_trace(parent.cloned());
        self.bus.publish(envelope).await?;
        Ok(())
    }
}

/// Send a core-owned report on its reserved selector.
pub async fn report(delivery: &Delivery<'_>, report: &ScanReport) -> Result<(), AgentError> {
    let selector = Selector::parse(report.selector_path()).map_err(|e| AgentError::handler(e.to_string()))?;
    let payload = report.encode().map_err(|e| AgentError::handler(e.to_string()))?;
    delivery.emit(selector, payload).await
}

/// Report that this agent cannot continue; the scan moves to ERROR.
pub async fn report_fault(
    delivery: &Delivery<'_>,
    reason: impl Into<String>,
) -> Result<(), AgentError> {
    let fault = ScanReport::Fault(AgentFault {
        agent_key: delivery.outbox.agent_name().to_string(),
        reason: reason.into(),
    });
    report(delivery, &fault).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::domain::selector::SelectorPattern;
    use vigil_core::infrastructure::InMemoryBus;

    struct Noop;

    #[async_trait]
    impl MessageHandler for Noop {
        async fn handle(&self, _delivery: Delivery<'_>) -> Result<(), AgentError> {
            Ok(())
        }
    }

    fn agent(bus: Arc<InMemoryBus>, scope: ScanScope) -> BusAgent<Noop> {
        BusAgent::new(
            "agent/crawler",
            scope,
            vec![Selector::parse("v3.asset.link.page").unwrap()],
            bus,
            Noop,
        )
    }

    #[tokio::test]
    async fn test_emit_scopes_declared_selectors() {
        let bus = Arc::new(InMemoryBus::new());
        let scope = ScanScope::generate();
        let agent = agent(bus.clone(), scope);
        let mut sub = bus
            .subscribe(vec![SelectorPattern::parse("v3.asset.link.page").unwrap().with_scope(scope)])
            .await
            .unwrap();

        agent
            .emit(None, Selector::parse("v3.asset.link.page").unwrap(), Bytes::from_static(b"{}"))
            .await
            .unwrap();

        let envelope = sub.recv().await.unwrap();
        assert_eq!(envelope.selector().scope(), Some(scope));
    }

    #[tokio::test]
    async fn test_emit_rejects_undeclared_and_foreign_scopes() {
        let bus = Arc::new(InMemoryBus::new());
        let scope = ScanScope::generate();
        let agent = agent(bus, scope);

        let undeclared = agent
            .emit(None, Selector::parse("v3.asset.ip.v4").unwrap(), Bytes::new())
            .await;
        assert!(matches!(undeclared, Err(AgentError::UndeclaredSelector { .. })));

        let foreign = Selector::parse("v3.asset.link.page")
            .unwrap()
            .with_scope(ScanScope::generate());
        assert!(agent.emit(None, foreign, Bytes::new()).await.is_err());

        // Reports need no declaration.
        let vuln = Selector::parse(well_known::REPORT_VULNERABILITY).unwrap();
        assert!(agent.emit(None, vuln, Bytes::from_static(b"{}")).await.is_ok());
    }
}
