//! Reply builders for request/reply routes.
//!
//! A builder turns a handler outcome into the bytes and headers sent back to
//! the requester. Routes without one use [`default_reply`].

use crate::error::{HandlerError, ReplyError};
use bytes::Bytes;
use nr_common::{Headers, HEADER_CONTENT_TYPE, HEADER_ERROR_CODE, HEADER_STATUS};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

const CONTENT_TYPE_JSON: &str = "application/json";
const CONTENT_TYPE_TEXT: &str = "text/plain";

/// Outcome of a handler as seen by a reply builder
pub type HandlerOutcome<'a> = Result<Option<Bytes>, &'a HandlerError>;

/// Payload and headers sent to the requester
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    pub payload: Bytes,
    pub headers: Headers,
}

impl Reply {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            headers: Headers::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }
}

/// Semantic status carried in the `X-Status` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Success,
    Error,
    Fail,
    Partial,
}

impl ReplyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyStatus::Success => "success",
            ReplyStatus::Error => "error",
            ReplyStatus::Fail => "fail",
            ReplyStatus::Partial => "partial",
        }
    }
}

impl fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type BuildFn = dyn for<'a> Fn(HandlerOutcome<'a>) -> Result<Reply, ReplyError> + Send + Sync;

/// Shared reply builder function
#[derive(Clone)]
pub struct ReplyBuilder(Arc<BuildFn>);

impl ReplyBuilder {
    pub fn new<F>(f: F) -> Self
    where
        F: for<'a> Fn(HandlerOutcome<'a>) -> Result<Reply, ReplyError> + Send + Sync + 'static,
    {
        ReplyBuilder(Arc::new(f))
    }

    pub fn build(&self, outcome: HandlerOutcome<'_>) -> Result<Reply, ReplyError> {
        (self.0)(outcome)
    }
}

impl fmt::Debug for ReplyBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ReplyBuilder(..)")
    }
}

/// Reply used when a route has no builder: `ok` on success, nothing on error
pub fn default_reply(outcome: HandlerOutcome<'_>) -> Option<Reply> {
    match outcome {
        Ok(_) => Some(Reply::new(Bytes::from_static(b"ok"))),
        Err(_) => None,
    }
}

/// Reply with the handler's bytes; errors are sent as text with `X-Status: error`
pub fn passthrough() -> ReplyBuilder {
    ReplyBuilder::new(|outcome| {
        Ok(match outcome {
            Ok(payload) => Reply::new(payload.unwrap_or_default()),
            Err(e) => Reply::new(e.to_string()).with_header(HEADER_STATUS, ReplyStatus::Error.as_str()),
        })
    })
}

/// JSON reply. The handler's bytes are sent as the JSON body (`null` when
/// empty); errors carry `X-Status: error`, the error text, and `X-Error-Code`
/// when the error has a code.
pub fn json() -> ReplyBuilder {
    ReplyBuilder::new(|outcome| {
        let reply = match outcome {
            Ok(payload) => Reply::new(payload.unwrap_or_else(|| Bytes::from_static(b"null")))
                .with_header(HEADER_STATUS, ReplyStatus::Success.as_str()),
            Err(e) => {
                let mut reply =
                    Reply::new(e.to_string()).with_header(HEADER_STATUS, ReplyStatus::Error.as_str());
                if let Some(code) = e.code() {
                    reply.headers.insert(HEADER_ERROR_CODE, code);
                }
                reply
            }
        };
        Ok(reply.with_header(HEADER_CONTENT_TYPE, CONTENT_TYPE_JSON))
    })
}

/// JSON reply with an explicit status
pub fn with_status<T: Serialize + ?Sized>(status: ReplyStatus, result: &T) -> Result<Reply, ReplyError> {
    let body = serde_json::to_vec(result).map_err(|e| ReplyError::Encode(e.to_string()))?;
    Ok(Reply::new(body)
        .with_header(HEADER_STATUS, status.as_str())
        .with_header(HEADER_CONTENT_TYPE, CONTENT_TYPE_JSON))
}

/// Plain-text error reply
pub fn error_reply(err: &dyn fmt::Display) -> Reply {
    Reply::new(err.to_string())
        .with_header(HEADER_STATUS, ReplyStatus::Error.as_str())
        .with_header(HEADER_CONTENT_TYPE, CONTENT_TYPE_TEXT)
}
