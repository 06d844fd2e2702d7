use std::collections::BTreeMap;

use rand::Rng;
use tracing::debug;

/// Propagation headers injected into every outgoing request.
pub const HEADER_SPAN_ID: &str = "X-YaSpanId";
pub const HEADER_TRACE_ID: &str = "X-YaTraceId";
pub const HEADER_REQUEST_ID: &str = "X-YaRequestId";

pub(crate) const TAG_HTTP_URL: &str = "http.url";
pub(crate) const TAG_HTTP_STATUS_CODE: &str = "http.status_code";
pub(crate) const TAG_ERROR: &str = "error";

/// Synthetic status tagged on the span when a transport error prevented any
/// HTTP status from being observed.
pub(crate) const SYNTHETIC_TRANSPORT_STATUS: u16 = 599;

/// A per-request tracing span. One span covers every attempt of a request
/// and is finished exactly once, at terminal resolution. Implementations
/// must not tie the span to any ambient task-local context: the span's
/// lifetime is independent of the awaiter.
pub trait TracingSpan: Send {
    fn trace_id(&self) -> &str;
    fn span_id(&self) -> &str;
    fn link_id(&self) -> &str;
    fn set_tag(&mut self, key: &'static str, value: String);
    fn finish(&mut self);
}

pub trait SpanFactory: Send + Sync {
    fn start_span(&self, client_name: &str) -> Box<dyn TracingSpan>;
}

/// Default span: random ids, tags collected in memory, emitted as a single
/// structured log record when the span finishes.
pub struct LogSpan {
    client_name: String,
    trace_id: String,
    span_id: String,
    link_id: String,
    tags: BTreeMap<&'static str, String>,
}

impl LogSpan {
    fn start(client_name: &str) -> Self {
        Self {
            client_name: client_name.to_owned(),
            trace_id: random_hex(32),
            span_id: random_hex(16),
            link_id: random_hex(16),
            tags: BTreeMap::new(),
        }
    }
}

impl TracingSpan for LogSpan {
    fn trace_id(&self) -> &str {
        &self.trace_id
    }

    fn span_id(&self) -> &str {
        &self.span_id
    }

    fn link_id(&self) -> &str {
        &self.link_id
    }

    fn set_tag(&mut self, key: &'static str, value: String) {
        self.tags.insert(key, value);
    }

    fn finish(&mut self) {
        debug!(
            target: "reqflow::span",
            client = %self.client_name,
            trace_id = %self.trace_id,
            span_id = %self.span_id,
            link_id = %self.link_id,
            tags = ?self.tags,
            "request span finished"
        );
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LogSpanFactory;

impl SpanFactory for LogSpanFactory {
    fn start_span(&self, client_name: &str) -> Box<dyn TracingSpan> {
        Box::new(LogSpan::start(client_name))
    }
}

fn random_hex(digits: usize) -> String {
    let mut rng = rand::rng();
    let mut text = String::with_capacity(digits);
    let mut remaining = digits;
    while remaining > 0 {
        let chunk = remaining.min(16);
        let value: u64 = rng.random();
        let formatted = format!("{value:016x}");
        text.push_str(&formatted[..chunk]);
        remaining -= chunk;
    }
    text
}

#[cfg(test)]
mod tests {
    use super::random_hex;

    #[test]
    fn random_hex_produces_requested_width() {
        let id = random_hex(16);
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|character| character.is_ascii_hexdigit()));

        let trace = random_hex(32);
        assert_eq!(trace.len(), 32);
    }
}
