// Copyright (c) 2026 Vigil Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Message Envelope & Processing Contract
//!
//! A [`MessageEnvelope`] is the unit of traffic on the bus: a [`Selector`], an
//! opaque payload and, when tracing is enabled, the [`TraceContext`] of the
//! span that emitted it. Payload schemas belong to the agents; the core never
//! inspects them except for the reserved `v3.report.*` / `v3.control.*`
//! selectors.
//!
//! Agents implement [`MessageProcessor`]. Tracing is layered on top by wrapping
//! a processor in a decorator implementing the same trait
//! (see `infrastructure::telemetry::Traced`), so callers only ever hold a
//! `dyn MessageProcessor`.

use crate::domain::bus::BusError;
use crate::domain::selector::Selector;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// W3C-style trace identifiers carried across process boundaries (hex encoded).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
}

/// Immutable message on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    selector: Selector,
    payload: Bytes,
    trace: Option<TraceContext>,
}

#[derive(Serialize, Deserialize)]
struct WireHeader {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    trace: Option<TraceContext>,
}

impl MessageEnvelope {
    pub fn new(selector: Selector, payload: impl Into<Bytes>) -> Self {
        Self {
            selector,
            payload: payload.into(),
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: Option<TraceContext>) -> Self {
        self.trace = trace;
        self
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn trace(&self) -> Option<&TraceContext> {
        self.trace.as_ref()
    }

    /// Frame for transports that only carry a byte string per topic:
    /// `u16` big-endian header length, JSON header, raw payload.
    pub fn encode(&self) -> Result<Bytes, BusError> {
        let header = serde_json::to_vec(&WireHeader {
            trace: self.trace.clone(),
        })
        .map_err(|e| BusError::Codec(e.to_string()))?;
        let header_len = u16::try_from(header.len())
            .map_err(|_| BusError::Codec(format!("header too large: {} bytes", header.len())))?;

        let mut frame = BytesMut::with_capacity(2 + header.len() + self.payload.len());
        frame.put_u16(header_len);
        frame.put_slice(&header);
        frame.put_slice(&self.payload);
        Ok(frame.freeze())
    }

    pub fn decode(selector: Selector, frame: Bytes) -> Result<Self, BusError> {
        if frame.len() < 2 {
            return Err(BusError::Codec("truncated frame".to_string()));
        }
        let header_len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
        if frame.len() < 2 + header_len {
            return Err(BusError::Codec(format!(
                "frame shorter than declared header ({} < {})",
                frame.len(),
                2 + header_len
            )));
        }
        let header: WireHeader = serde_json::from_slice(&frame[2..2 + header_len])
            .map_err(|e| BusError::Codec(e.to_string()))?;

        Ok(Self {
            selector,
            payload: frame.slice(2 + header_len..),
            trace: header.trace,
        })
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Message handler failed: {0}")]
    Handler(String),

    #[error("Payload on '{selector}' could not be decoded: {reason}")]
    Decode { selector: String, reason: String },

    #[error("Agent '{agent}' is not allowed to emit on '{selector}'")]
    UndeclaredSelector { agent: String, selector: String },

    #[error(transparent)]
    Bus(#[from] BusError),
}

impl AgentError {
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }
}

/// One inbound message handed to a processor.
///
/// `context` is the trace context work done for this message should parent
/// onto; `outbox` is the outermost processor, so emissions made while handling
/// go through every decorator that wraps the agent.
#[derive(Clone, Copy)]
pub struct Delivery<'a> {
    pub envelope: &'a MessageEnvelope,
    pub context: Option<&'a TraceContext>,
    pub outbox: &'a dyn MessageProcessor,
}

impl<'a> Delivery<'a> {
    pub fn new(envelope: &'a MessageEnvelope, outbox: &'a dyn MessageProcessor) -> Self {
        Self {
            envelope,
            context: envelope.trace(),
            outbox,
        }
    }

    pub fn with_context(self, context: Option<&'a TraceContext>) -> Self {
        Self { context, ..self }
    }

    pub fn selector(&self) -> &Selector {
        self.envelope.selector()
    }

    pub fn payload(&self) -> &Bytes {
        self.envelope.payload()
    }

    /// Emit a message caused by this delivery.
    pub async fn emit(&self, selector: Selector, payload: Bytes) -> Result<(), AgentError> {
        self.outbox.emit(self.context, selector, payload).await
    }
}

/// Receive/emit contract of a bus-bound agent.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    fn agent_name(&self) -> &str;

    async fn process(&self, delivery: Delivery<'_>) -> Result<(), AgentError>;

    async fn emit(
        &self,
        parent: Option<&TraceContext>,
        selector: Selector,
        payload: Bytes,
    ) -> Result<(), AgentError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::selector::{build, ScanScope};

    #[test]
    fn test_frame_preserves_trace_and_payload() {
        let selector = build("v3.asset.link", ScanScope::generate()).unwrap();
        let envelope = MessageEnvelope::new(selector.clone(), Bytes::from_static(b"\x00\x01raw"))
            .with_trace(Some(TraceContext {
                trace_id: "0af7651916cd43dd8448eb211c80319c".into(),
                span_id: "b7ad6b7169203331".into(),
            }));

        let frame = envelope.encode().unwrap();
        let decoded = MessageEnvelope::decode(selector, frame).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_decode_rejects_truncated_frame() {
        let selector = Selector::parse("v3.asset.link").unwrap();
        assert!(matches!(
            MessageEnvelope::decode(selector.clone(), Bytes::from_static(b"\x00")),
            Err(BusError::Codec(_))
        ));
        assert!(matches!(
            MessageEnvelope::decode(selector, Bytes::from_static(b"\x00\x10{}")),
            Err(BusError::Codec(_))
        ));
    }
}
