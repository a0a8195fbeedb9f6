use bytes::Bytes;
use indexmap::IndexMap;

pub mod logging;

// ============================================================================
// Header Names
// ============================================================================

/// Original failure message, attached to dead-letter envelopes only
pub const HEADER_ERROR: &str = "X-Error";
/// Delivery count at the point of exhaustion, attached to dead-letter envelopes only
pub const HEADER_RETRY_COUNT: &str = "X-Retry-Count";
/// Correlation identifier copied from request to reply (multi-value)
pub const HEADER_CORRELATION_ID: &str = "X-Correlation-ID";
/// W3C trace context
pub const HEADER_TRACE_PARENT: &str = "traceparent";
/// W3C vendor-specific trace state
pub const HEADER_TRACE_STATE: &str = "tracestate";
/// W3C baggage
pub const HEADER_BAGGAGE: &str = "baggage";
/// Semantic reply status (success, error, fail, partial)
pub const HEADER_STATUS: &str = "X-Status";
/// Machine-readable error code on error replies
pub const HEADER_ERROR_CODE: &str = "X-Error-Code";
/// Media type of a reply body
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
/// Message id used by durable streams for duplicate detection
pub const HEADER_MSG_ID: &str = "Nats-Msg-Id";

// ============================================================================
// Headers
// ============================================================================

/// Multi-value message headers.
///
/// Names are case-sensitive, as on the wire. Insertion order is preserved so
/// that what a handler sets is what the peer sees.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: IndexMap<String, Vec<String>>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every value of `name` with `value`
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(name.into(), vec![value.into()]);
    }

    /// Add `value` to the values already held for `name`
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.entry(name.into()).or_default().push(value.into());
    }

    /// First value of `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn get_all(&self, name: &str) -> &[String] {
        self.entries.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        self.entries.shift_remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Number of distinct header names
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Headers
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.append(name, value);
        }
        headers
    }
}

impl<K, V, const N: usize> From<[(K, V); N]> for Headers
where
    K: Into<String>,
    V: Into<String>,
{
    fn from(pairs: [(K, V); N]) -> Self {
        pairs.into_iter().collect()
    }
}

// ============================================================================
// Messages
// ============================================================================

/// A message as handed over by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub subject: String,
    /// Reply inbox, present for requests
    pub reply: Option<String>,
    pub payload: Bytes,
    pub headers: Headers,
}

impl InboundMessage {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            payload: payload.into(),
            headers: Headers::new(),
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }
}

/// A message to hand to the transport for publishing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub subject: String,
    pub payload: Bytes,
    pub headers: Headers,
}

impl OutboundMessage {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
            headers: Headers::new(),
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }
}
