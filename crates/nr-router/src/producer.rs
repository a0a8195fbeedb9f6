//! Publishing side of a subject.

use crate::error::{ProducerError, RouteError};
use bytes::Bytes;
use nr_common::{Headers, OutboundMessage, HEADER_MSG_ID};
use nr_transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Per-publish options
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub headers: Headers,
    /// Sent as `Nats-Msg-Id`; streams with a duplicate window drop repeats
    pub msg_id: Option<String>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_msg_id(mut self, id: impl Into<String>) -> Self {
        self.msg_id = Some(id.into());
        self
    }

    /// Random message id, for callers that only need a retry to be idempotent
    pub fn with_generated_msg_id(self) -> Self {
        self.with_msg_id(uuid::Uuid::new_v4().to_string())
    }
}

/// Publishes raw payloads to one subject
#[derive(Clone)]
pub struct Producer {
    transport: Arc<dyn Transport>,
    subject: String,
}

impl Producer {
    pub fn new(transport: Arc<dyn Transport>, subject: impl Into<String>) -> Result<Self, ProducerError> {
        let subject = subject.into();
        if subject.trim().is_empty() {
            return Err(RouteError::MissingSubject.into());
        }
        Ok(Self { transport, subject })
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub async fn publish(&self, payload: impl Into<Bytes>, options: PublishOptions) -> Result<(), ProducerError> {
        let PublishOptions { mut headers, msg_id } = options;
        if let Some(id) = msg_id {
            headers.insert(HEADER_MSG_ID, id);
        }

        let message = OutboundMessage::new(self.subject.clone(), payload).with_headers(headers);
        self.transport.publish(message).await?;
        debug!(subject = %self.subject, "Published");
        Ok(())
    }

    /// Send a request and wait up to `timeout` for the reply payload
    pub async fn request(&self, payload: impl Into<Bytes>, timeout: Duration) -> Result<Bytes, ProducerError> {
        let message = OutboundMessage::new(self.subject.clone(), payload);
        let reply = self.transport.request(message, timeout).await?;
        Ok(reply.payload)
    }
}
