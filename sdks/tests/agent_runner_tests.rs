// Copyright (c) 2026 Vigil Contributors
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vigil_agent_sdk::{
    report_fault, AgentError, AgentRunner, BusAgent, Delivery, MessageHandler, RunOutcome,
};
use vigil_core::domain::bus::{MessageBus, Subscription};
use vigil_core::domain::message::MessageEnvelope;
use vigil_core::domain::report::{CancelRequest, ScanReport};
use vigil_core::domain::selector::{self, well_known, ScanScope, Selector, SelectorPattern};
use vigil_core::infrastructure::{InMemoryBus, Traced};

const WAIT: Duration = Duration::from_secs(2);

/// Turns every link into a crawled page.
struct Crawler {
    seen: AtomicUsize,
}

#[async_trait]
impl MessageHandler for Crawler {
    async fn handle(&self, delivery: Delivery<'_>) -> Result<(), AgentError> {
        self.seen.fetch_add(1, Ordering::SeqCst);
        let page = Selector::parse("v3.asset.link.page").map_err(|e| AgentError::handler(e.to_string()))?;
        delivery.emit(page, delivery.payload().clone()).await
    }
}

struct Broken;

#[async_trait]
impl MessageHandler for Broken {
    async fn handle(&self, delivery: Delivery<'_>) -> Result<(), AgentError> {
        report_fault(&delivery, "target refused every connection").await
    }
}

fn runner<H: MessageHandler>(
    bus: &Arc<InMemoryBus>,
    scope: ScanScope,
    handler: H,
) -> AgentRunner<Traced<BusAgent<H>>> {
    let agent = BusAgent::new(
        "agent/crawler",
        scope,
        vec![Selector::parse("v3.asset.link.page").unwrap()],
        bus.clone(),
        handler,
    );
    let patterns = vec![SelectorPattern::parse(well_known::ASSET_LINK).unwrap().with_scope(scope)];
    AgentRunner::new(Traced::new(agent, None), bus.clone(), scope, patterns)
}

async fn wait_for_subscribers(bus: &InMemoryBus, count: usize) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while bus.subscriber_count() < count {
        assert!(tokio::time::Instant::now() < deadline, "runner never subscribed");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn publish(bus: &InMemoryBus, path: &str, scope: ScanScope, payload: &'static [u8]) {
    let selector = selector::build(path, scope).unwrap();
    bus.publish(MessageEnvelope::new(selector, Bytes::from_static(payload)))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_runner_processes_until_cancelled() {
    let bus = Arc::new(InMemoryBus::new());
    let scope = ScanScope::generate();
    let mut pages = bus
        .subscribe(vec![SelectorPattern::parse("v3.asset.link.page").unwrap().with_scope(scope)])
        .await
        .unwrap();

    let task = tokio::spawn(runner(&bus, scope, Crawler { seen: AtomicUsize::new(0) }).run());
    wait_for_subscribers(&bus, 2).await;

    publish(&bus, well_known::ASSET_LINK, scope, b"https://example.com").await;
    let page = tokio::time::timeout(WAIT, pages.recv()).await.unwrap().unwrap();
    assert_eq!(page.selector().scope(), Some(scope));
    assert_eq!(page.payload().as_ref(), b"https://example.com");

    let cancel = CancelRequest {
        reason: "scan stopped".into(),
    };
    let selector = selector::build(well_known::CONTROL_CANCEL, scope).unwrap();
    bus.publish(MessageEnvelope::new(selector, cancel.encode().unwrap()))
        .await
        .unwrap();

    let outcome = tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome, RunOutcome::Cancelled);
}

async fn page_subscription(bus: &InMemoryBus, scope: ScanScope) -> Subscription {
    bus.subscribe(vec![SelectorPattern::parse("v3.asset.link.page").unwrap().with_scope(scope)])
        .await
        .unwrap()
}

#[tokio::test]
async fn test_other_scopes_are_not_delivered() {
    let bus = Arc::new(InMemoryBus::new());
    let scope = ScanScope::generate();
    let mut pages = page_subscription(&bus, scope).await;
    let runner = runner(&bus, scope, Crawler { seen: AtomicUsize::new(0) })
        .with_idle_timeout(Duration::from_millis(100));
    let task = tokio::spawn(runner.run());
    wait_for_subscribers(&bus, 2).await;

    publish(&bus, well_known::ASSET_LINK, ScanScope::generate(), b"https://other.test").await;
    publish(&bus, well_known::ASSET_LINK, scope, b"https://own.test").await;

    let outcome = tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome, RunOutcome::Idle);
    let page = pages.try_recv().expect("own scope was not processed");
    assert_eq!(page.payload().as_ref(), b"https://own.test");
    assert!(pages.try_recv().is_none());
}

#[tokio::test]
async fn test_idle_clock_starts_at_first_delivery() {
    let bus = Arc::new(InMemoryBus::new());
    let scope = ScanScope::generate();
    let mut pages = page_subscription(&bus, scope).await;
    let runner = runner(&bus, scope, Crawler { seen: AtomicUsize::new(0) })
        .with_idle_timeout(Duration::from_millis(50));
    let task = tokio::spawn(runner.run());
    wait_for_subscribers(&bus, 2).await;

    // The first asset arrives well after one idle period.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!task.is_finished());
    publish(&bus, well_known::ASSET_LINK, scope, b"https://late.test").await;

    let page = tokio::time::timeout(WAIT, pages.recv()).await.unwrap().unwrap();
    assert_eq!(page.payload().as_ref(), b"https://late.test");
    let outcome = tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome, RunOutcome::Idle);
}

#[tokio::test]
async fn test_idle_runner_reports_completion() {
    let bus = Arc::new(InMemoryBus::new());
    let scope = ScanScope::generate();
    let mut reports = bus
        .subscribe(vec![SelectorPattern::parse(well_known::REPORT_AGENT_COMPLETED)
            .unwrap()
            .with_scope(scope)])
        .await
        .unwrap();

    let runner = runner(&bus, scope, Crawler { seen: AtomicUsize::new(0) })
        .with_idle_timeout(Duration::from_millis(30));
    let task = tokio::spawn(runner.run());
    wait_for_subscribers(&bus, 2).await;
    publish(&bus, well_known::ASSET_LINK, scope, b"https://example.com").await;

    let outcome = tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome, RunOutcome::Idle);

    let envelope = tokio::time::timeout(WAIT, reports.recv()).await.unwrap().unwrap();
    match ScanReport::decode(envelope.selector(), envelope.payload()).unwrap() {
        Some(ScanReport::AgentCompleted(done)) => assert_eq!(done.agent_key, "agent/crawler"),
        other => panic!("unexpected report: {:?}", other),
    }
}

#[tokio::test]
async fn test_released_scope_stops_runner() {
    let bus = Arc::new(InMemoryBus::new());
    let scope = ScanScope::generate();
    let task = tokio::spawn(runner(&bus, scope, Crawler { seen: AtomicUsize::new(0) }).run());
    wait_for_subscribers(&bus, 1).await;

    bus.release_scope(scope).await.unwrap();

    let outcome = tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome, RunOutcome::Released);
}

#[tokio::test]
async fn test_fault_report_is_scoped() {
    let bus = Arc::new(InMemoryBus::new());
    let scope = ScanScope::generate();
    let mut faults = bus
        .subscribe(vec![SelectorPattern::parse(well_known::REPORT_FAULT).unwrap().with_scope(scope)])
        .await
        .unwrap();

    let runner = runner(&bus, scope, Broken);
    let shutdown = runner.shutdown_token();
    let task = tokio::spawn(runner.run());
    wait_for_subscribers(&bus, 2).await;

    publish(&bus, well_known::ASSET_LINK, scope, b"https://down.test").await;
    let envelope = tokio::time::timeout(WAIT, faults.recv()).await.unwrap().unwrap();
    match ScanReport::decode(envelope.selector(), envelope.payload()).unwrap() {
        Some(ScanReport::Fault(fault)) => {
            assert_eq!(fault.agent_key, "agent/crawler");
            assert_eq!(fault.reason, "target refused every connection");
        }
        other => panic!("unexpected report: {:?}", other),
    }

    shutdown.cancel();
    let outcome = tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome, RunOutcome::Shutdown);
}
