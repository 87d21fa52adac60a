// Copyright (c) 2026 Vigil Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Message Tracing
//!
//! [`TracingContext`] owns the single span exporter of an agent process and is
//! built once at startup from the tracing endpoint string. [`Traced`] wraps any
//! [`MessageProcessor`] and opens a `process_message` / `emit_message` span
//! around each call, parented on the trace context carried by the envelope, so
//! that one inbound message always gets its own span tree.
//!
//! Export is best effort. Exporter failures are logged and never surface to
//! message handlers.

use crate::domain::message::{AgentError, Delivery, MessageProcessor, TraceContext};
use crate::domain::selector::Selector;
use crate::domain::telemetry::{TracingConfigError, TracingEndpoint};
use async_trait::async_trait;
use bytes::Bytes;
use opentelemetry::trace::{
    Span as _, SpanContext, SpanId, Status, TraceContextExt as _, TraceFlags, TraceId, TraceState,
    Tracer as _, TracerProvider as _,
};
use opentelemetry::{Context, KeyValue};
use opentelemetry_otlp::WithExportConfig as _;
use opentelemetry_sdk::error::{OTelSdkError, OTelSdkResult};
use opentelemetry_sdk::trace::{SdkTracer, SdkTracerProvider, Span, SpanData, SpanExporter};
use opentelemetry_sdk::Resource;
use parking_lot::Mutex;
use std::fmt;
use std::fs::OpenOptions;
use std::future::Future;
use std::io::{BufWriter, Write};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

pub const PROCESS_SPAN: &str = "process_message";
pub const EMIT_SPAN: &str = "emit_message";
pub const AGENT_NAME_ATTRIBUTE: &str = "agent.name";
pub const SELECTOR_ATTRIBUTE: &str = "message.selector";

const TRACER_NAME: &str = "vigil";

type SharedSink = Arc<Mutex<Box<dyn Write + Send>>>;

/// Per-process tracing state. Cheap to share behind an `Arc`.
pub struct TracingContext {
    provider: SdkTracerProvider,
    tracer: SdkTracer,
    sink: Option<SharedSink>,
}

impl TracingContext {
    /// `None` when no endpoint is configured; tracing is then disabled.
    pub fn from_url(
        url: Option<&str>,
        service_name: &str,
    ) -> Result<Option<Arc<Self>>, TracingConfigError> {
        match url.filter(|u| !u.is_empty()) {
            Some(url) => {
                let endpoint: TracingEndpoint = url.parse()?;
                Ok(Some(Arc::new(Self::new(&endpoint, service_name)?)))
            }
            None => Ok(None),
        }
    }

    pub fn new(endpoint: &TracingEndpoint, service_name: &str) -> Result<Self, TracingConfigError> {
        match endpoint {
            TracingEndpoint::Jaeger { host, port } => {
                if endpoint.targets_jaeger_agent() {
                    warn!(
                        %endpoint,
                        "Port {} is a Jaeger agent UDP port; spans are sent over OTLP gRPC \
                         and need the collector's OTLP port (usually 4317)",
                        port
                    );
                }
                let exporter = opentelemetry_otlp::SpanExporter::builder()
                    .with_tonic()
                    .with_endpoint(format!("http://{}:{}", host, port))
                    .build()
                    .map_err(|e| TracingConfigError::Exporter(e.to_string()))?;
                let provider = SdkTracerProvider::builder()
                    .with_resource(resource(service_name))
                    .with_batch_exporter(exporter)
                    .build();
                debug!(%endpoint, "Tracing enabled");
                Ok(Self::from_provider(provider, None))
            }
            TracingEndpoint::File(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| {
                        TracingConfigError::Exporter(format!("cannot open {:?}: {}", path, e))
                    })?;
                debug!(%endpoint, "Tracing enabled");
                Ok(Self::with_writer(Box::new(BufWriter::new(file)), service_name))
            }
        }
    }

    /// JSON-lines exporter over an arbitrary sink.
    pub fn with_writer(writer: Box<dyn Write + Send>, service_name: &str) -> Self {
        let sink: SharedSink = Arc::new(Mutex::new(writer));
        let provider = SdkTracerProvider::builder()
            .with_resource(resource(service_name))
            .with_simple_exporter(FileSpanExporter { sink: sink.clone() })
            .build();
        Self::from_provider(provider, Some(sink))
    }

    fn from_provider(provider: SdkTracerProvider, sink: Option<SharedSink>) -> Self {
        let tracer = provider.tracer(TRACER_NAME);
        Self {
            provider,
            tracer,
            sink,
        }
    }

    /// Write every finished span out. Call before the process exits.
    pub fn flush(&self) {
        if let Err(e) = self.provider.force_flush() {
            warn!("Span exporter flush failed: {}", e);
        }
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.lock().flush() {
                warn!("Span file flush failed: {}", e);
            }
        }
    }

    pub fn shutdown(&self) {
        self.flush();
        if let Err(e) = self.provider.shutdown() {
            debug!("Tracer provider shutdown: {}", e);
        }
    }

    fn start_span(
        &self,
        name: &'static str,
        parent: Option<&TraceContext>,
        agent: &str,
        selector: &Selector,
    ) -> Span {
        let cx = match parent.and_then(remote_span_context) {
            Some(sc) => Context::new().with_remote_span_context(sc),
            None => Context::new(),
        };
        let mut span = self.tracer.start_with_context(name, &cx);
        span.set_attribute(KeyValue::new(AGENT_NAME_ATTRIBUTE, agent.to_string()));
        span.set_attribute(KeyValue::new(SELECTOR_ATTRIBUTE, selector.to_string()));
        span
    }
}

impl fmt::Debug for TracingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracingContext")
            .field("file_sink", &self.sink.is_some())
            .finish()
    }
}

fn resource(service_name: &str) -> Resource {
    Resource::builder()
        .with_service_name(service_name.to_string())
        .build()
}

fn remote_span_context(parent: &TraceContext) -> Option<SpanContext> {
    let trace_id = TraceId::from_hex(&parent.trace_id).ok()?;
    let span_id = SpanId::from_hex(&parent.span_id).ok()?;
    let sc = SpanContext::new(trace_id, span_id, TraceFlags::SAMPLED, true, TraceState::default());
    sc.is_valid().then_some(sc)
}

fn trace_context_of(span: &Span) -> TraceContext {
    let sc = span.span_context();
    TraceContext {
        trace_id: format!("{:032x}", sc.trace_id()),
        span_id: format!("{:016x}", sc.span_id()),
    }
}

fn finish(mut span: Span, result: &Result<(), AgentError>) {
    if let Err(e) = result {
        span.record_error(e);
        span.set_status(Status::error(e.to_string()));
    }
    span.end();
}

/// Tracing decorator for a message processor.
pub struct Traced<P> {
    inner: P,
    tracing: Option<Arc<TracingContext>>,
}

impl<P> Traced<P> {
    pub fn new(inner: P, tracing: Option<Arc<TracingContext>>) -> Self {
        Self { inner, tracing }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    pub fn tracing(&self) -> Option<&Arc<TracingContext>> {
        self.tracing.as_ref()
    }
}

#[async_trait]
impl<P: MessageProcessor> MessageProcessor for Traced<P> {
    fn agent_name(&self) -> &str {
        self.inner.agent_name()
    }

    async fn process(&self, delivery: Delivery<'_>) -> Result<(), AgentError> {
        let Some(tracing) = &self.tracing else {
            return self.inner.process(delivery).await;
        };
        let span = tracing.start_span(
            PROCESS_SPAN,
            delivery.envelope.trace(),
            self.agent_name(),
            delivery.selector(),
        );
        let context = trace_context_of(&span);
        let result = self.inner.process(delivery.with_context(Some(&context))).await;
        finish(span, &result);
        result
    }

    async fn emit(
        &self,
        parent: Option<&TraceContext>,
        selector: Selector,
        payload: Bytes,
    ) -> Result<(), AgentError> {
        let Some(tracing) = &self.tracing else {
            return self.inner.emit(parent, selector, payload).await;
        };
        let span = tracing.start_span(EMIT_SPAN, parent, self.agent_name(), &selector);
        let context = trace_context_of(&span);
        let result = self.inner.emit(Some(&context), selector, payload).await;
        finish(span, &result);
        result
    }
}

/// Appends one JSON object per finished span.
struct FileSpanExporter {
    sink: SharedSink,
}

impl fmt::Debug for FileSpanExporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FileSpanExporter")
    }
}

impl FileSpanExporter {
    fn write_batch(&self, batch: &[SpanData]) -> OTelSdkResult {
        let mut sink = self.sink.lock();
        for span in batch {
            let line = span_json(span);
            writeln!(sink, "{}", line)
                .map_err(|e| OTelSdkError::InternalFailure(format!("span write failed: {}", e)))?;
        }
        Ok(())
    }
}

impl SpanExporter for FileSpanExporter {
    fn export(&self, batch: Vec<SpanData>) -> impl Future<Output = OTelSdkResult> + Send {
        std::future::ready(self.write_batch(&batch))
    }
}

fn span_json(span: &SpanData) -> serde_json::Value {
    let attributes: serde_json::Map<String, serde_json::Value> = span
        .attributes
        .iter()
        .map(|kv| {
            (
                kv.key.as_str().to_string(),
                serde_json::Value::String(kv.value.as_str().into_owned()),
            )
        })
        .collect();
    let status = match &span.status {
        Status::Unset => serde_json::json!({ "code": "unset" }),
        Status::Ok => serde_json::json!({ "code": "ok" }),
        Status::Error { description } => {
            serde_json::json!({ "code": "error", "description": description.to_string() })
        }
    };
    let parent = (span.parent_span_id != SpanId::INVALID)
        .then(|| format!("{:016x}", span.parent_span_id));

    serde_json::json!({
        "name": span.name.to_string(),
        "trace_id": format!("{:032x}", span.span_context.trace_id()),
        "span_id": format!("{:016x}", span.span_context.span_id()),
        "parent_span_id": parent,
        "start_time_unix_nano": unix_nanos(span.start_time),
        "end_time_unix_nano": unix_nanos(span.end_time),
        "attributes": attributes,
        "status": status,
    })
}

fn unix_nanos(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::message::MessageEnvelope;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        processed: AtomicUsize,
        emitted: Mutex<Vec<(Selector, Option<TraceContext>)>>,
        echo_to: Option<Selector>,
        fail: bool,
    }

    #[async_trait]
    impl MessageProcessor for Recorder {
        fn agent_name(&self) -> &str {
            "agent/recorder"
        }

        async fn process(&self, delivery: Delivery<'_>) -> Result<(), AgentError> {
            self.processed.fetch_add(1, Ordering::SeqCst);
            if let Some(selector) = &self.echo_to {
                delivery.emit(selector.clone(), delivery.payload().clone()).await?;
            }
            if self.fail {
                return Err(AgentError::handler("boom"));
            }
            Ok(())
        }

        async fn emit(
            &self,
            parent: Option<&TraceContext>,
            selector: Selector,
            _payload: Bytes,
        ) -> Result<(), AgentError> {
            self.emitted.lock().push((selector, parent.cloned()));
            Ok(())
        }
    }

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }
    }

    fn envelope() -> MessageEnvelope {
        MessageEnvelope::new(Selector::parse("v3.asset.link").unwrap(), Bytes::from_static(b"x"))
    }

    #[tokio::test]
    async fn test_untraced_calls_handler_exactly_once() {
        let traced = Traced::new(
            Recorder {
                echo_to: Some(Selector::parse("v3.report.vulnerability").unwrap()),
                ..Default::default()
            },
            None,
        );
        let env = envelope();

        traced.process(Delivery::new(&env, &traced)).await.unwrap();

        assert_eq!(traced.inner().processed.load(Ordering::SeqCst), 1);
        let emitted = traced.inner().emitted.lock();
        assert_eq!(emitted.len(), 1);
        assert!(emitted[0].1.is_none());
    }

    #[tokio::test]
    async fn test_file_exporter_writes_nested_spans() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spans.jsonl");
        let endpoint: TracingEndpoint = format!("file:{}", path.display()).parse().unwrap();
        let tracing = Arc::new(TracingContext::new(&endpoint, "agent/recorder").unwrap());
        let traced = Traced::new(
            Recorder {
                echo_to: Some(Selector::parse("v3.report.vulnerability").unwrap()),
                ..Default::default()
            },
            Some(tracing.clone()),
        );
        let env = envelope();

        traced.process(Delivery::new(&env, &traced)).await.unwrap();
        tracing.flush();

        let content = std::fs::read_to_string(&path).unwrap();
        let spans: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(spans.len(), 2);

        // Spans are exported as they end: the emit span closes first.
        let emit = &spans[0];
        let process = &spans[1];
        assert_eq!(emit["name"], EMIT_SPAN);
        assert_eq!(process["name"], PROCESS_SPAN);
        assert_eq!(process["attributes"][AGENT_NAME_ATTRIBUTE], "agent/recorder");
        assert_eq!(process["attributes"][SELECTOR_ATTRIBUTE], "v3.asset.link");
        assert_eq!(emit["attributes"][SELECTOR_ATTRIBUTE], "v3.report.vulnerability");
        assert_eq!(emit["parent_span_id"], process["span_id"]);
        assert_eq!(emit["trace_id"], process["trace_id"]);

        // The published message carries the emit span as its parent.
        let emitted = traced.inner().emitted.lock();
        let carried = emitted[0].1.as_ref().unwrap();
        assert_eq!(serde_json::Value::from(carried.span_id.clone()), emit["span_id"]);
    }

    #[tokio::test]
    async fn test_each_message_gets_its_own_trace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spans.jsonl");
        let endpoint = TracingEndpoint::File(path.clone());
        let tracing = Arc::new(TracingContext::new(&endpoint, "agent/recorder").unwrap());
        let traced = Traced::new(Recorder::default(), Some(tracing.clone()));

        let first = envelope();
        let second = envelope();
        traced.process(Delivery::new(&first, &traced)).await.unwrap();
        traced.process(Delivery::new(&second, &traced)).await.unwrap();
        tracing.flush();

        let content = std::fs::read_to_string(&path).unwrap();
        let spans: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(spans.len(), 2);
        assert_ne!(spans[0]["trace_id"], spans[1]["trace_id"]);
        assert!(spans[0]["parent_span_id"].is_null());
    }

    #[tokio::test]
    async fn test_parent_taken_from_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spans.jsonl");
        let tracing = Arc::new(TracingContext::new(&TracingEndpoint::File(path.clone()), "a").unwrap());
        let traced = Traced::new(Recorder::default(), Some(tracing.clone()));
        let parent = TraceContext {
            trace_id: "0af7651916cd43dd8448eb211c80319c".into(),
            span_id: "b7ad6b7169203331".into(),
        };
        let env = envelope().with_trace(Some(parent.clone()));

        traced.process(Delivery::new(&env, &traced)).await.unwrap();
        tracing.flush();

        let line = std::fs::read_to_string(&path).unwrap();
        let span: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(span["trace_id"], parent.trace_id.as_str());
        assert_eq!(span["parent_span_id"], parent.span_id.as_str());
    }

    #[tokio::test]
    async fn test_handler_error_recorded_and_returned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spans.jsonl");
        let tracing = Arc::new(TracingContext::new(&TracingEndpoint::File(path.clone()), "a").unwrap());
        let traced = Traced::new(
            Recorder {
                fail: true,
                ..Default::default()
            },
            Some(tracing.clone()),
        );
        let env = envelope();

        let result = traced.process(Delivery::new(&env, &traced)).await;
        tracing.flush();

        assert!(matches!(result, Err(AgentError::Handler(_))));
        let line = std::fs::read_to_string(&path).unwrap();
        let span: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(span["status"]["code"], "error");
    }

    #[tokio::test]
    async fn test_failing_exporter_does_not_break_processing() {
        let tracing = Arc::new(TracingContext::with_writer(Box::new(FailingWriter), "a"));
        let traced = Traced::new(
            Recorder {
                echo_to: Some(Selector::parse("v3.asset.link").unwrap()),
                ..Default::default()
            },
            Some(tracing.clone()),
        );
        let env = envelope();

        traced.process(Delivery::new(&env, &traced)).await.unwrap();
        traced
            .emit(None, Selector::parse("v3.asset.link").unwrap(), Bytes::new())
            .await
            .unwrap();
        tracing.flush();

        assert_eq!(traced.inner().processed.load(Ordering::SeqCst), 1);
        assert_eq!(traced.inner().emitted.lock().len(), 2);
    }

    #[test]
    fn test_unknown_exporter_fails_fast() {
        assert!(matches!(
            TracingContext::from_url(Some("zipkin:localhost:9411"), "a"),
            Err(TracingConfigError::UnknownExporter(_))
        ));
        assert!(TracingContext::from_url(None, "a").unwrap().is_none());
    }
}
