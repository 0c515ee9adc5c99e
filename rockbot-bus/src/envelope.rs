//! The immutable message envelope.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::bus::BusMessage;
use crate::error::BusError;
use crate::headers;
use crate::trace::TraceContext;

/// Trust level of an envelope's content.
///
/// Carried in the `content-trust` header so downstream components can treat
/// tool output and user input with less authority than system messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentTrust {
    /// Produced by the runtime itself.
    System,
    /// Verbatim user input.
    UserInput,
    /// Output of a tool invocation.
    ToolOutput,
}

impl ContentTrust {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentTrust::System => "system",
            ContentTrust::UserInput => "user-input",
            ContentTrust::ToolOutput => "tool-output",
        }
    }
}

impl FromStr for ContentTrust {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(ContentTrust::System),
            "user-input" => Ok(ContentTrust::UserInput),
            "tool-output" => Ok(ContentTrust::ToolOutput),
            _ => Err(()),
        }
    }
}

/// The uniform message carrier across the bus.
///
/// Envelopes are immutable once created: construction assigns a fresh
/// message id and timestamp, `with_*` methods consume and return the
/// envelope, and the body is shared read-only. The body is an opaque byte
/// sequence; for JSON payloads use [`Envelope::from_payload`] and
/// [`Envelope::payload`].
#[derive(Debug, Clone)]
pub struct Envelope {
    message_id: String,
    message_type: String,
    correlation_id: Option<String>,
    reply_to: Option<String>,
    source: String,
    destination: Option<String>,
    timestamp: DateTime<Utc>,
    body: Arc<[u8]>,
    headers: BTreeMap<String, String>,
}

impl Envelope {
    /// Create an envelope with a fresh message id and the current timestamp.
    pub fn new(
        message_type: impl Into<String>,
        body: impl Into<Vec<u8>>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            message_type: message_type.into(),
            correlation_id: None,
            reply_to: None,
            source: source.into(),
            destination: None,
            timestamp: Utc::now(),
            body: body.into().into(),
            headers: BTreeMap::new(),
        }
    }

    /// Create an envelope by JSON-encoding a typed payload.
    ///
    /// The message type is taken from the payload's [`BusMessage`]
    /// declaration.
    pub fn from_payload<T: BusMessage>(payload: &T, source: impl Into<String>) -> Result<Self, BusError> {
        let body = serde_json::to_vec(payload)?;
        Ok(Self::new(T::MESSAGE_TYPE, body, source))
    }

    /// Decode the body as JSON into `T`, returning `None` on any mismatch.
    pub fn payload<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_slice(&self.body).ok()
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Correlation id copied through request/response chains.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Copy the correlation id (falling back to the message id) from a
    /// request envelope onto this response envelope.
    pub fn correlated_to(self, request: &Envelope) -> Self {
        let id = request
            .correlation_id()
            .unwrap_or_else(|| request.message_id())
            .to_string();
        self.with_correlation_id(id)
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_headers<I, K, V>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in entries {
            self.headers.insert(k.into(), v.into());
        }
        self
    }

    pub fn with_content_trust(self, trust: ContentTrust) -> Self {
        self.with_header(headers::CONTENT_TRUST, trust.as_str())
    }

    pub fn content_trust(&self) -> Option<ContentTrust> {
        self.header(headers::CONTENT_TRUST)?.parse().ok()
    }

    /// Inject a trace context into the envelope headers.
    pub fn with_trace_context(self, context: &TraceContext) -> Self {
        let mut env = self.with_header(headers::TRACEPARENT, context.to_traceparent());
        if let Some(state) = context.tracestate() {
            env = env.with_header(headers::TRACESTATE, state);
        }
        env
    }

    /// Extract the trace context carried in the envelope headers, if any.
    pub fn trace_context(&self) -> Option<TraceContext> {
        let mut context = TraceContext::parse(self.header(headers::TRACEPARENT)?)?;
        if let Some(state) = self.header(headers::TRACESTATE) {
            context = context.with_tracestate(state);
        }
        Some(context)
    }

    /// Override the timestamp. Intended for replay and tests; normal
    /// construction always stamps the current time.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Reconstruct an envelope from broker metadata. Used by bus adapters
    /// when decoding a delivery; application code should use
    /// [`Envelope::new`] or [`Envelope::from_payload`].
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        message_id: String,
        message_type: String,
        correlation_id: Option<String>,
        reply_to: Option<String>,
        source: String,
        destination: Option<String>,
        timestamp: DateTime<Utc>,
        body: Vec<u8>,
        headers: BTreeMap<String, String>,
    ) -> Self {
        Self {
            message_id,
            message_type,
            correlation_id,
            reply_to,
            source,
            destination,
            timestamp,
            body: body.into(),
            headers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Ping {
        session_id: String,
        attempt: u32,
    }

    impl BusMessage for Ping {
        const MESSAGE_TYPE: &'static str = "ping";
    }

    #[test]
    fn test_payload_round_trip() {
        let ping = Ping {
            session_id: "s1".to_string(),
            attempt: 3,
        };
        let envelope = Envelope::from_payload(&ping, "tester").unwrap();

        assert_eq!(envelope.message_type(), "ping");
        assert_eq!(envelope.source(), "tester");
        assert_eq!(envelope.payload::<Ping>(), Some(ping));
    }

    #[test]
    fn test_payload_uses_camel_case_keys() {
        let ping = Ping {
            session_id: "s1".to_string(),
            attempt: 1,
        };
        let envelope = Envelope::from_payload(&ping, "tester").unwrap();
        let raw = std::str::from_utf8(envelope.body()).unwrap();

        assert!(raw.contains("sessionId"));
        assert!(!raw.contains("session_id"));
    }

    #[test]
    fn test_payload_mismatch_returns_none() {
        let envelope = Envelope::new("ping", b"not json".to_vec(), "tester");
        assert_eq!(envelope.payload::<Ping>(), None);
    }

    #[test]
    fn test_message_ids_are_unique() {
        let a = Envelope::new("t", vec![], "s");
        let b = Envelope::new("t", vec![], "s");
        assert_ne!(a.message_id(), b.message_id());
    }

    #[test]
    fn test_correlated_to_prefers_correlation_id() {
        let request = Envelope::new("req", vec![], "caller").with_correlation_id("corr-1");
        let response = Envelope::new("resp", vec![], "callee").correlated_to(&request);
        assert_eq!(response.correlation_id(), Some("corr-1"));

        let bare = Envelope::new("req", vec![], "caller");
        let response = Envelope::new("resp", vec![], "callee").correlated_to(&bare);
        assert_eq!(response.correlation_id(), Some(bare.message_id()));
    }

    #[test]
    fn test_content_trust_round_trip() {
        let envelope = Envelope::new("t", vec![], "s").with_content_trust(ContentTrust::ToolOutput);
        assert_eq!(envelope.content_trust(), Some(ContentTrust::ToolOutput));
        assert_eq!(envelope.header(headers::CONTENT_TRUST), Some("tool-output"));
    }

    #[test]
    fn test_trace_context_round_trip() {
        let context = TraceContext::new_root().with_tracestate("rb=1");
        let envelope = Envelope::new("t", vec![], "s").with_trace_context(&context);

        let extracted = envelope.trace_context().unwrap();
        assert_eq!(extracted.trace_id(), context.trace_id());
        assert_eq!(extracted.span_id(), context.span_id());
        assert_eq!(extracted.tracestate(), Some("rb=1"));
    }
}
