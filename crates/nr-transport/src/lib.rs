//! Messaging transport seam.
//!
//! The router only talks to a transport through the traits in this crate:
//! plain and queue-group subscriptions, publish, request/reply, and durable
//! stream consumers with explicit acknowledgement. Two implementations ship:
//!
//! - [`memory::MemoryTransport`]: in-process, always built, used by tests and dev mode
//! - `nats::NatsTransport`: async-nats client and JetStream (feature `nats`)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nr_common::{InboundMessage, OutboundMessage};
use std::time::Duration;

pub mod error;
pub mod memory;
pub mod subject;

#[cfg(feature = "nats")]
pub mod nats;

pub use error::TransportError;
pub use memory::MemoryTransport;

#[cfg(feature = "nats")]
pub use nats::{NatsConnectOptions, NatsTransport};

pub type Result<T> = std::result::Result<T, TransportError>;

/// Where a new durable consumer starts reading the stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliverPolicy {
    /// From the first message still held by the stream
    #[default]
    All,
    /// From the most recent message
    Last,
    /// Only messages published after the consumer is created
    New,
    /// From the given stream sequence
    ByStartSequence(u64),
    /// From the first message stored at or after the given time
    ByStartTime(DateTime<Utc>),
    /// The most recent message of every subject, then everything new
    LastPerSubject,
}

/// Durable consumer definition, created or updated on attach
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableConsumerConfig {
    pub durable_name: String,
    pub filter_subject: String,
    pub deliver_policy: DeliverPolicy,
    pub ack_wait: Duration,
    /// Deliveries before the transport gives up on a message
    pub max_deliver: u64,
}

/// A live subscription
#[async_trait]
pub trait Subscription: Send {
    /// Next message, or None once the subscription is closed or fully drained
    async fn next(&mut self) -> Option<InboundMessage>;

    /// Stop receiving new messages. Messages already buffered are still
    /// returned by `next` before it yields None.
    async fn drain(&mut self) -> Result<()>;
}

/// One delivery from a durable consumer
#[async_trait]
pub trait StreamMessage: Send + Sync {
    fn message(&self) -> &InboundMessage;

    /// How many times this message has been delivered to the consumer, starting at 1
    fn num_delivered(&self) -> u64;

    /// Mark processed; the message is not delivered again
    async fn ack(&self) -> Result<()>;

    /// Ask for redelivery
    async fn nak(&self) -> Result<()>;
}

/// A pull loop over a durable consumer
#[async_trait]
pub trait DurableConsumer: Send {
    /// Next delivery, or None once stopped
    async fn next(&mut self) -> Option<Result<Box<dyn StreamMessage>>>;

    /// Stop pulling. Unacknowledged deliveries are redelivered after ack-wait.
    async fn stop(&mut self) -> Result<()>;
}

/// Connection-level operations used by the router and producers
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Subscribe to a subject; with a queue group each message goes to one member
    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<Box<dyn Subscription>>;

    async fn publish(&self, message: OutboundMessage) -> Result<()>;

    /// Publish and wait for a single reply
    async fn request(&self, message: OutboundMessage, timeout: Duration) -> Result<InboundMessage>;

    /// Create or update a durable consumer on `stream` and attach to it
    async fn durable_consumer(
        &self,
        stream: &str,
        config: DurableConsumerConfig,
    ) -> Result<Box<dyn DurableConsumer>>;
}
