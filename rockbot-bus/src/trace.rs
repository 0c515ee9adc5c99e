//! W3C trace-context propagation.
//!
//! Envelopes carry `traceparent`/`tracestate` headers so a turn that fans
//! out across processes still stitches into one trace. The context here is
//! deliberately minimal: parse, format, and derive child spans. Exporters
//! live outside this crate.

use rand::RngCore;

const SUPPORTED_VERSION: &str = "00";

/// A parsed W3C trace context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    trace_id: String,
    span_id: String,
    sampled: bool,
    tracestate: Option<String>,
}

impl TraceContext {
    /// Start a new sampled root trace.
    pub fn new_root() -> Self {
        let mut rng = rand::thread_rng();
        let mut trace = [0u8; 16];
        let mut span = [0u8; 8];
        rng.fill_bytes(&mut trace);
        rng.fill_bytes(&mut span);
        Self {
            trace_id: hex_encode(&trace),
            span_id: hex_encode(&span),
            sampled: true,
            tracestate: None,
        }
    }

    /// Derive a child context: same trace id, fresh span id.
    pub fn child(&self) -> Self {
        let mut span = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut span);
        Self {
            trace_id: self.trace_id.clone(),
            span_id: hex_encode(&span),
            sampled: self.sampled,
            tracestate: self.tracestate.clone(),
        }
    }

    /// Parse a `traceparent` header value.
    ///
    /// Only version `00` is understood. All-zero trace or span ids are
    /// rejected per the W3C spec.
    pub fn parse(traceparent: &str) -> Option<Self> {
        let mut parts = traceparent.trim().split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let span_id = parts.next()?;
        let flags = parts.next()?;
        if parts.next().is_some() || version != SUPPORTED_VERSION {
            return None;
        }
        if trace_id.len() != 32 || !is_lower_hex(trace_id) || is_all_zero(trace_id) {
            return None;
        }
        if span_id.len() != 16 || !is_lower_hex(span_id) || is_all_zero(span_id) {
            return None;
        }
        if flags.len() != 2 || !is_lower_hex(flags) {
            return None;
        }
        let sampled = u8::from_str_radix(flags, 16).ok()? & 0x01 == 0x01;
        Some(Self {
            trace_id: trace_id.to_string(),
            span_id: span_id.to_string(),
            sampled,
            tracestate: None,
        })
    }

    /// Format as a `traceparent` header value.
    pub fn to_traceparent(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            SUPPORTED_VERSION,
            self.trace_id,
            self.span_id,
            if self.sampled { "01" } else { "00" }
        )
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    pub fn sampled(&self) -> bool {
        self.sampled
    }

    pub fn tracestate(&self) -> Option<&str> {
        self.tracestate.as_deref()
    }

    pub fn with_tracestate(mut self, tracestate: impl Into<String>) -> Self {
        self.tracestate = Some(tracestate.into());
        self
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

fn is_lower_hex(s: &str) -> bool {
    s.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

fn is_all_zero(s: &str) -> bool {
    s.chars().all(|c| c == '0')
}
