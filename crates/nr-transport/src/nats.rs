//! NATS transport over async-nats and JetStream.
//!
//! Reconnection is left to the client library; the options below only tune it.

use crate::{
    DeliverPolicy, DurableConsumer, DurableConsumerConfig, Result, StreamMessage, Subscription,
    Transport, TransportError,
};
use async_nats::jetstream::{self, consumer::pull, AckKind};
use async_nats::{HeaderMap, RequestErrorKind};
use async_trait::async_trait;
use futures::StreamExt;
use nr_common::{Headers, InboundMessage, OutboundMessage};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Connection settings
#[derive(Debug, Clone)]
pub struct NatsConnectOptions {
    pub url: String,
    /// Defaults to `natsroute-<8 hex chars>`
    pub name: Option<String>,
    pub connect_timeout: Duration,
    pub reconnect_wait: Duration,
    /// None reconnects forever
    pub max_reconnects: Option<usize>,
}

impl Default for NatsConnectOptions {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            name: None,
            connect_timeout: Duration::from_secs(5),
            reconnect_wait: Duration::from_secs(2),
            max_reconnects: None,
        }
    }
}

fn generated_client_name() -> String {
    format!("natsroute-{}", hex::encode(rand::random::<[u8; 4]>()))
}

/// Transport backed by a NATS connection
#[derive(Clone)]
pub struct NatsTransport {
    client: async_nats::Client,
    jetstream: jetstream::Context,
}

impl NatsTransport {
    pub async fn connect(options: &NatsConnectOptions) -> Result<Self> {
        let name = options.name.clone().unwrap_or_else(generated_client_name);
        let reconnect_wait = options.reconnect_wait;

        let client = async_nats::ConnectOptions::new()
            .name(&name)
            .connection_timeout(options.connect_timeout)
            .max_reconnects(options.max_reconnects)
            .reconnect_delay_callback(move |_attempts| reconnect_wait)
            .connect(options.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        info!(url = %options.url, client = %name, "Connected to NATS");
        Ok(Self::from_client(client))
    }

    /// Wrap an already connected client
    pub fn from_client(client: async_nats::Client) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self { client, jetstream }
    }

    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }

    /// Flush pending publishes
    pub async fn flush(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| TransportError::Publish {
                subject: String::new(),
                reason: e.to_string(),
            })
    }
}

fn to_header_map(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, values) in headers.iter() {
        for value in values {
            map.append(name, value.as_str());
        }
    }
    map
}

fn from_header_map(map: Option<&HeaderMap>) -> Headers {
    let mut headers = Headers::new();
    if let Some(map) = map {
        for (name, values) in map.iter() {
            for value in values {
                headers.append(name.to_string(), value.to_string());
            }
        }
    }
    headers
}

fn to_inbound(message: &async_nats::Message) -> InboundMessage {
    InboundMessage {
        subject: message.subject.to_string(),
        reply: message.reply.as_ref().map(|r| r.to_string()),
        payload: message.payload.clone(),
        headers: from_header_map(message.headers.as_ref()),
    }
}

fn to_jetstream_policy(policy: DeliverPolicy) -> Result<jetstream::consumer::DeliverPolicy> {
    use jetstream::consumer::DeliverPolicy as Js;
    Ok(match policy {
        DeliverPolicy::All => Js::All,
        DeliverPolicy::Last => Js::Last,
        DeliverPolicy::New => Js::New,
        DeliverPolicy::ByStartSequence(start_sequence) => Js::ByStartSequence { start_sequence },
        DeliverPolicy::ByStartTime(start) => {
            let nanos = start.timestamp_nanos_opt().ok_or_else(|| {
                TransportError::Consumer(format!("start time {start} is out of range"))
            })?;
            let start_time = time::OffsetDateTime::from_unix_timestamp_nanos(nanos as i128)
                .map_err(|e| TransportError::Consumer(e.to_string()))?;
            Js::ByStartTime { start_time }
        }
        DeliverPolicy::LastPerSubject => Js::LastPerSubject,
    })
}

#[async_trait]
impl Transport for NatsTransport {
    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<Box<dyn Subscription>> {
        let result = match queue_group {
            Some(group) => {
                self.client
                    .queue_subscribe(subject.to_string(), group.to_string())
                    .await
            }
            None => self.client.subscribe(subject.to_string()).await,
        };
        let subscriber = result.map_err(|e| TransportError::Subscribe {
            subject: subject.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Box::new(NatsSubscription { subscriber }))
    }

    async fn publish(&self, message: OutboundMessage) -> Result<()> {
        let headers = to_header_map(&message.headers);
        self.client
            .publish_with_headers(message.subject.clone(), headers, message.payload)
            .await
            .map_err(|e| TransportError::Publish {
                subject: message.subject,
                reason: e.to_string(),
            })
    }

    async fn request(&self, message: OutboundMessage, timeout: Duration) -> Result<InboundMessage> {
        let headers = to_header_map(&message.headers);
        let pending = self.client.request_with_headers(
            message.subject.clone(),
            headers,
            message.payload,
        );

        match tokio::time::timeout(timeout, pending).await {
            Err(_) => Err(TransportError::Timeout(timeout)),
            Ok(Ok(reply)) => Ok(to_inbound(&reply)),
            Ok(Err(e)) => match e.kind() {
                RequestErrorKind::NoResponders => Err(TransportError::NoResponders(message.subject)),
                RequestErrorKind::TimedOut => Err(TransportError::Timeout(timeout)),
                _ => Err(TransportError::Request {
                    subject: message.subject,
                    reason: e.to_string(),
                }),
            },
        }
    }

    async fn durable_consumer(
        &self,
        stream: &str,
        config: DurableConsumerConfig,
    ) -> Result<Box<dyn DurableConsumer>> {
        let js_stream = self.jetstream.get_stream(stream).await.map_err(|e| {
            match e.kind() {
                jetstream::context::GetStreamErrorKind::JetStream(inner)
                    if inner.error_code() == jetstream::ErrorCode::STREAM_NOT_FOUND =>
                {
                    TransportError::StreamNotFound(stream.to_string())
                }
                _ => TransportError::Consumer(e.to_string()),
            }
        })?;

        let consumer = js_stream
            .create_consumer(pull::Config {
                durable_name: Some(config.durable_name.clone()),
                filter_subject: config.filter_subject.clone(),
                ack_policy: jetstream::consumer::AckPolicy::Explicit,
                deliver_policy: to_jetstream_policy(config.deliver_policy)?,
                ack_wait: config.ack_wait,
                max_deliver: config.max_deliver as i64,
                ..Default::default()
            })
            .await
            .map_err(|e| TransportError::Consumer(e.to_string()))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| TransportError::Consumer(e.to_string()))?;

        debug!(
            stream = %stream,
            durable = %config.durable_name,
            filter = %config.filter_subject,
            "Durable consumer attached"
        );

        Ok(Box::new(NatsDurableConsumer {
            messages: Some(messages),
        }))
    }
}

struct NatsSubscription {
    subscriber: async_nats::Subscriber,
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn next(&mut self) -> Option<InboundMessage> {
        self.subscriber.next().await.map(|m| to_inbound(&m))
    }

    async fn drain(&mut self) -> Result<()> {
        self.subscriber
            .drain()
            .await
            .map_err(|e| TransportError::Subscribe {
                subject: String::new(),
                reason: format!("drain failed: {e}"),
            })
    }
}

struct NatsDurableConsumer {
    messages: Option<pull::Stream>,
}

#[async_trait]
impl DurableConsumer for NatsDurableConsumer {
    async fn next(&mut self) -> Option<Result<Box<dyn StreamMessage>>> {
        let messages = self.messages.as_mut()?;
        match messages.next().await? {
            Ok(message) => {
                let inbound = to_inbound(&message.message);
                let num_delivered = match message.info() {
                    Ok(info) => info.delivered.max(1) as u64,
                    Err(e) => {
                        warn!(subject = %inbound.subject, error = %e, "Missing delivery metadata");
                        1
                    }
                };
                Some(Ok(Box::new(NatsStreamMessage {
                    message,
                    inbound,
                    num_delivered,
                })))
            }
            Err(e) => Some(Err(TransportError::Consumer(e.to_string()))),
        }
    }

    async fn stop(&mut self) -> Result<()> {
        // Unacknowledged deliveries go back to the stream after ack-wait
        self.messages = None;
        Ok(())
    }
}

struct NatsStreamMessage {
    message: jetstream::Message,
    inbound: InboundMessage,
    num_delivered: u64,
}

#[async_trait]
impl StreamMessage for NatsStreamMessage {
    fn message(&self) -> &InboundMessage {
        &self.inbound
    }

    fn num_delivered(&self) -> u64 {
        self.num_delivered
    }

    async fn ack(&self) -> Result<()> {
        self.message
            .ack()
            .await
            .map_err(|e| TransportError::Ack(e.to_string()))
    }

    async fn nak(&self) -> Result<()> {
        self.message
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| TransportError::Ack(e.to_string()))
    }
}
