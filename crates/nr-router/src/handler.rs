//! Message handlers.

use crate::error::HandlerError;
use async_trait::async_trait;
use bytes::Bytes;
use nr_common::{Headers, InboundMessage};
use std::future::Future;
use std::sync::Arc;

/// What a handler returns: optional result bytes, or an error
pub type HandlerResult = Result<Option<Bytes>, HandlerError>;

/// One inbound message as seen by a handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub subject: String,
    pub payload: Bytes,
    pub headers: Headers,
    /// Delivery count, durable stream routes only
    pub num_delivered: Option<u64>,
}

impl Delivery {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
            headers: Headers::new(),
            num_delivered: None,
        }
    }

    pub(crate) fn from_message(message: &InboundMessage, num_delivered: Option<u64>) -> Self {
        Self {
            subject: message.subject.clone(),
            payload: message.payload.clone(),
            headers: message.headers.clone(),
            num_delivered,
        }
    }
}

/// Processes messages for a route
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, delivery: Delivery) -> HandlerResult;
}

/// Shared handle to a handler
pub type SharedHandler = Arc<dyn Handler>;

/// Handler backed by an async closure, see [`handler_fn`]
pub struct HandlerFn<F> {
    f: F,
}

/// Adapt an async closure into a [`Handler`]
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, delivery: Delivery) -> HandlerResult {
        (self.f)(delivery).await
    }
}
