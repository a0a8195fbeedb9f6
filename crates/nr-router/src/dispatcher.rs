//! Per-pattern delivery engine.
//!
//! [`Dispatcher::start`] subscribes for one route and spawns the task that
//! processes its messages until cancellation. Every message is handled inside
//! a recovered scope: a handler panic or timeout becomes a [`HandlerError`]
//! and follows the same policy as a returned error.
//!
//! | Pattern | Success | Failure |
//! |---|---|---|
//! | Broadcast / Queue | - | logged |
//! | RequestReply | reply built and sent | passed to the reply builder |
//! | DurableStream | ack | nak, or dead-letter then ack once `max_deliver` is reached |

use crate::error::HandlerError;
use crate::handler::{Delivery, HandlerResult, SharedHandler};
use crate::headers::propagate_headers;
use crate::reply::{default_reply, HandlerOutcome, Reply};
use crate::route::{DurableSettings, Route, RouteKind};
use futures::FutureExt;
use nr_common::{Headers, InboundMessage, OutboundMessage, HEADER_ERROR, HEADER_RETRY_COUNT};
use nr_transport::{DurableConsumer, StreamMessage, Subscription, Transport, TransportError};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn, Instrument, Span};

/// Starts route subscriptions on a transport
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Subscribe for `route` and process its messages with `handler`.
    ///
    /// Returns once the subscription (or durable consumer) exists; the
    /// returned task runs until `cancel` fires, then drains and finishes the
    /// messages it already holds.
    pub async fn start(
        &self,
        cancel: CancellationToken,
        route: Arc<Route>,
        handler: SharedHandler,
    ) -> Result<JoinHandle<()>, TransportError> {
        let processor = MessageProcessor {
            transport: self.transport.clone(),
            route: route.clone(),
            handler,
        };

        match route.kind() {
            RouteKind::Broadcast => {
                let subscription = self.transport.subscribe(route.subject(), None).await?;
                Ok(spawn_subscription_loop(cancel, processor, subscription))
            }
            RouteKind::Queue { queue_group } => {
                let subscription = self
                    .transport
                    .subscribe(route.subject(), Some(queue_group))
                    .await?;
                Ok(spawn_subscription_loop(cancel, processor, subscription))
            }
            RouteKind::RequestReply { queue_group, .. } => {
                let subscription = self
                    .transport
                    .subscribe(route.subject(), queue_group.as_deref())
                    .await?;
                Ok(spawn_subscription_loop(cancel, processor, subscription))
            }
            RouteKind::DurableStream(settings) => {
                let consumer = self
                    .transport
                    .durable_consumer(&settings.stream, settings.consumer_config(route.subject()))
                    .await?;
                Ok(spawn_durable_loop(cancel, processor, consumer))
            }
        }
    }
}

fn spawn_subscription_loop(
    cancel: CancellationToken,
    processor: MessageProcessor,
    mut subscription: Box<dyn Subscription>,
) -> JoinHandle<()> {
    let task = async move {
        debug!(subject = %processor.route.subject(), pattern = %processor.route.pattern(), "Route started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = subscription.next() => match next {
                    Some(message) => processor.process_message(message).await,
                    None => {
                        debug!(subject = %processor.route.subject(), "Subscription closed");
                        return;
                    }
                },
            }
        }

        if let Err(e) = subscription.drain().await {
            warn!(subject = %processor.route.subject(), error = %e, "Drain failed");
        }
        while let Some(message) = subscription.next().await {
            processor.process_message(message).await;
        }
        debug!(subject = %processor.route.subject(), "Route drained");
    };
    tokio::spawn(task.instrument(Span::current()))
}

fn spawn_durable_loop(
    cancel: CancellationToken,
    processor: MessageProcessor,
    mut consumer: Box<dyn DurableConsumer>,
) -> JoinHandle<()> {
    let task = async move {
        debug!(subject = %processor.route.subject(), pattern = %processor.route.pattern(), "Route started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = consumer.next() => match next {
                    Some(Ok(message)) => processor.process_stream_message(message).await,
                    Some(Err(e)) => {
                        warn!(subject = %processor.route.subject(), error = %e, "Consumer error");
                    }
                    None => {
                        debug!(subject = %processor.route.subject(), "Consumer closed");
                        return;
                    }
                },
            }
        }

        if let Err(e) = consumer.stop().await {
            warn!(subject = %processor.route.subject(), error = %e, "Consumer stop failed");
        }
        debug!(subject = %processor.route.subject(), "Route drained");
    };
    tokio::spawn(task.instrument(Span::current()))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct MessageProcessor {
    transport: Arc<dyn Transport>,
    route: Arc<Route>,
    handler: SharedHandler,
}

impl MessageProcessor {
    /// Run the handler with panic containment and the route's timeout
    async fn invoke(&self, delivery: Delivery) -> HandlerResult {
        let subject = delivery.subject.clone();
        let guarded = AssertUnwindSafe(self.handler.handle(delivery)).catch_unwind();

        let outcome = match self.route.handler_timeout() {
            Some(limit) => match tokio::time::timeout(limit, guarded).await {
                Ok(outcome) => outcome,
                Err(_) => return Err(HandlerError::Timeout(limit)),
            },
            None => guarded.await,
        };

        outcome.unwrap_or_else(|payload| {
            let panic = panic_message(payload.as_ref());
            error!(subject = %subject, panic = %panic, "Handler panic recovered");
            Err(HandlerError::Panicked(panic))
        })
    }

    /// Broadcast, Queue and RequestReply messages
    async fn process_message(&self, message: InboundMessage) {
        let result = self.invoke(Delivery::from_message(&message, None)).await;

        if let Err(e) = &result {
            error!(subject = %message.subject, error = %e, "Handler error");
        }

        if let RouteKind::RequestReply { .. } = self.route.kind() {
            self.reply(&message, result).await;
        }
    }

    async fn reply(&self, request: &InboundMessage, result: HandlerResult) {
        let Some(reply_to) = request.reply.as_deref() else {
            debug!(subject = %request.subject, "Request has no reply subject");
            return;
        };

        let outcome: HandlerOutcome<'_> = match &result {
            Ok(payload) => Ok(payload.clone()),
            Err(e) => Err(e),
        };

        let reply = match self.route.reply_builder() {
            None => match default_reply(outcome) {
                Some(reply) => reply,
                // Handler error already logged; the requester times out
                None => return,
            },
            Some(builder) => {
                match std::panic::catch_unwind(AssertUnwindSafe(|| builder.build(outcome))) {
                    Ok(Ok(reply)) => reply,
                    Ok(Err(e)) => {
                        error!(subject = %request.subject, error = %e, "Reply builder error");
                        return;
                    }
                    Err(payload) => {
                        error!(
                            subject = %request.subject,
                            panic = %panic_message(payload.as_ref()),
                            "Reply builder panic recovered"
                        );
                        return;
                    }
                }
            }
        };

        let Reply { payload, mut headers } = reply;
        propagate_headers(&request.headers, &mut headers);

        let out = OutboundMessage {
            subject: reply_to.to_string(),
            payload,
            headers,
        };
        if let Err(e) = self.transport.publish(out).await {
            error!(subject = %request.subject, error = %e, "Reply send error");
        }
    }

    /// DurableStream deliveries
    async fn process_stream_message(&self, message: Box<dyn StreamMessage>) {
        let Some(settings) = self.route.durable_settings() else {
            return;
        };

        let num_delivered = message.num_delivered();
        let delivery = Delivery::from_message(message.message(), Some(num_delivered));

        match self.invoke(delivery).await {
            Ok(_) => {
                if let Err(e) = message.ack().await {
                    error!(subject = %self.route.subject(), error = %e, "Ack error");
                }
            }
            Err(e) => {
                error!(
                    subject = %self.route.subject(),
                    error = %e,
                    num_delivered,
                    "Handler error"
                );
                if settings.dead_letter && num_delivered >= settings.max_deliver {
                    self.dead_letter(message.as_ref(), settings, num_delivered, &e).await;
                } else if let Err(nak_err) = message.nak().await {
                    error!(subject = %self.route.subject(), error = %nak_err, "Nak error");
                }
            }
        }
    }

    async fn dead_letter(
        &self,
        message: &dyn StreamMessage,
        settings: &DurableSettings,
        num_delivered: u64,
        err: &HandlerError,
    ) {
        let dlq_subject = self.route.dead_letter_subject();

        let mut headers = Headers::new();
        headers.insert(HEADER_ERROR, err.to_string());
        headers.insert(HEADER_RETRY_COUNT, num_delivered.to_string());

        let envelope = OutboundMessage {
            subject: dlq_subject.clone(),
            payload: message.message().payload.clone(),
            headers,
        };

        if let Err(e) = self.transport.publish(envelope).await {
            error!(subject = %dlq_subject, error = %e, "Dead-letter publish error");
            if let Err(nak_err) = message.nak().await {
                error!(subject = %self.route.subject(), error = %nak_err, "Nak error");
            }
            return;
        }

        warn!(
            subject = %self.route.subject(),
            stream = %settings.stream,
            dlq = %dlq_subject,
            num_delivered,
            "Message dead-lettered"
        );

        if let Err(e) = message.ack().await {
            error!(subject = %self.route.subject(), error = %e, "Ack error after dead-letter");
        }
    }
}
