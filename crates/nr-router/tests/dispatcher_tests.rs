//! Dispatcher Tests
//!
//! Tests for:
//! - Request/reply: default reply, reply builders, header propagation
//! - Failure containment: handler errors, panics, timeouts
//! - Durable streams: redelivery, dead-lettering, panic accounting
//! - Cancellation and drain

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nr_common::{
    Headers, OutboundMessage, HEADER_CORRELATION_ID, HEADER_ERROR, HEADER_RETRY_COUNT, HEADER_STATUS,
    HEADER_TRACE_PARENT,
};
use nr_router::{
    handler_fn, reply, Delivery, Dispatcher, HandlerError, HandlerResult, ReplyBuilder, ReplyError, Route, RoutePattern,
    SharedHandler,
};
use nr_transport::{MemoryTransport, Subscription, Transport, TransportError};
use parking_lot::Mutex;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(2);

/// Handler counting invocations, failing or succeeding on demand
struct CountingHandler {
    calls: Arc<AtomicU32>,
}

impl CountingHandler {
    fn failing() -> (SharedHandler, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let handler = handler_fn(move |_delivery: Delivery| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(HandlerError::new("processing failed")) }
        });
        (Arc::new(handler), calls)
    }

    fn recording() -> (SharedHandler, Arc<Mutex<Vec<Bytes>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let handler = handler_fn(move |delivery: Delivery| {
            recorder.lock().push(delivery.payload);
            async { Ok(None) }
        });
        (Arc::new(handler), seen)
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn explode(reason: &str) -> HandlerResult {
    panic!("{reason}")
}

fn ok_handler() -> SharedHandler {
    Arc::new(handler_fn(|_| async { Ok(None) }))
}

fn durable_route(max_deliver: u64, dead_letter: bool) -> Arc<Route> {
    Arc::new(
        Route::builder(RoutePattern::DurableStream, "orders.created")
            .stream("ORDERS")
            .durable("order-processor")
            .max_deliver(max_deliver)
            .dead_letter(dead_letter)
            .build()
            .unwrap(),
    )
}

fn orders_transport() -> MemoryTransport {
    let transport = MemoryTransport::new();
    transport.add_stream("ORDERS", ["orders.>"], Duration::from_secs(120));
    transport
}

mod request_reply {
    use super::*;

    #[tokio::test]
    async fn test_default_reply_is_ok() {
        let transport = MemoryTransport::new();
        let dispatcher = Dispatcher::new(Arc::new(transport.clone()));
        let route = Arc::new(Route::new(RoutePattern::RequestReply, "orders.get").unwrap());
        let cancel = CancellationToken::new();

        dispatcher.start(cancel.clone(), route, ok_handler()).await.unwrap();

        let reply = transport
            .request(OutboundMessage::new("orders.get", "42"), WAIT)
            .await
            .unwrap();
        assert_eq!(reply.payload, "ok");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_handler_error_without_builder_sends_no_reply() {
        let transport = MemoryTransport::new();
        let dispatcher = Dispatcher::new(Arc::new(transport.clone()));
        let route = Arc::new(Route::new(RoutePattern::RequestReply, "orders.get").unwrap());
        let (handler, calls) = CountingHandler::failing();
        let cancel = CancellationToken::new();

        dispatcher.start(cancel.clone(), route, handler).await.unwrap();

        let result = transport
            .request(OutboundMessage::new("orders.get", "42"), Duration::from_millis(200))
            .await;
        assert!(matches!(result, Err(TransportError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_reply_builder_receives_handler_result() {
        let transport = MemoryTransport::new();
        let dispatcher = Dispatcher::new(Arc::new(transport.clone()));
        let route = Arc::new(
            Route::builder(RoutePattern::RequestReply, "orders.get")
                .queue_group("lookup")
                .reply_builder(reply::passthrough())
                .build()
                .unwrap(),
        );
        let handler: SharedHandler = Arc::new(handler_fn(|delivery: Delivery| async move {
            Ok(Some(Bytes::from(format!("order {}", String::from_utf8_lossy(&delivery.payload)))))
        }));
        let cancel = CancellationToken::new();

        dispatcher.start(cancel.clone(), route, handler).await.unwrap();

        let reply = transport
            .request(OutboundMessage::new("orders.get", "42"), WAIT)
            .await
            .unwrap();
        assert_eq!(reply.payload, "order 42");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_only_allow_listed_headers_are_propagated() {
        let transport = MemoryTransport::new();
        let dispatcher = Dispatcher::new(Arc::new(transport.clone()));
        let route = Arc::new(
            Route::builder(RoutePattern::RequestReply, "orders.get")
                .reply_builder(reply::json())
                .build()
                .unwrap(),
        );
        let cancel = CancellationToken::new();
        dispatcher.start(cancel.clone(), route, ok_handler()).await.unwrap();

        let mut headers = Headers::new();
        headers.append(HEADER_CORRELATION_ID, "corr-1");
        headers.append(HEADER_CORRELATION_ID, "corr-2");
        headers.insert(HEADER_TRACE_PARENT, "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01");
        headers.insert("X-Tenant", "acme");
        headers.insert("Authorization", "Bearer secret");

        let request = OutboundMessage::new("orders.get", "{}").with_headers(headers);
        let reply = transport.request(request, WAIT).await.unwrap();

        assert_eq!(reply.headers.get(HEADER_STATUS), Some("success"));
        assert_eq!(reply.headers.get_all(HEADER_CORRELATION_ID), ["corr-1", "corr-2"]);
        assert!(reply.headers.contains(HEADER_TRACE_PARENT));
        assert!(!reply.headers.contains("X-Tenant"));
        assert!(!reply.headers.contains("Authorization"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_default_reply_carries_propagated_headers() {
        let transport = MemoryTransport::new();
        let dispatcher = Dispatcher::new(Arc::new(transport.clone()));
        let route = Arc::new(Route::new(RoutePattern::RequestReply, "orders.get").unwrap());
        let cancel = CancellationToken::new();
        dispatcher.start(cancel.clone(), route, ok_handler()).await.unwrap();

        let request = OutboundMessage::new("orders.get", "")
            .with_headers(Headers::from([(HEADER_CORRELATION_ID, "abc")]));
        let reply = transport.request(request, WAIT).await.unwrap();

        assert_eq!(reply.payload, "ok");
        assert_eq!(reply.headers.get(HEADER_CORRELATION_ID), Some("abc"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_reply_builder_error_sends_nothing() {
        let transport = MemoryTransport::new();
        let dispatcher = Dispatcher::new(Arc::new(transport.clone()));
        let builder = ReplyBuilder::new(|_| Err(ReplyError::Build("cannot render".to_string())));
        let route = Arc::new(
            Route::builder(RoutePattern::RequestReply, "orders.get")
                .reply_builder(builder)
                .build()
                .unwrap(),
        );
        let cancel = CancellationToken::new();
        dispatcher.start(cancel.clone(), route, ok_handler()).await.unwrap();

        let result = transport
            .request(OutboundMessage::new("orders.get", ""), Duration::from_millis(200))
            .await;
        assert!(matches!(result, Err(TransportError::Timeout(_))));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_reply_builder_panic_is_contained() {
        let transport = MemoryTransport::new();
        let dispatcher = Dispatcher::new(Arc::new(transport.clone()));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let builder = ReplyBuilder::new(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("builder bug");
            }
            Ok(nr_router::Reply::new("second"))
        });
        let route = Arc::new(
            Route::builder(RoutePattern::RequestReply, "orders.get")
                .reply_builder(builder)
                .build()
                .unwrap(),
        );
        let cancel = CancellationToken::new();
        dispatcher.start(cancel.clone(), route, ok_handler()).await.unwrap();

        let first = transport
            .request(OutboundMessage::new("orders.get", ""), Duration::from_millis(200))
            .await;
        assert!(matches!(first, Err(TransportError::Timeout(_))));

        let second = transport
            .request(OutboundMessage::new("orders.get", ""), WAIT)
            .await
            .unwrap();
        assert_eq!(second.payload, "second");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_error_reply_and_route_survives() {
        let transport = MemoryTransport::new();
        let dispatcher = Dispatcher::new(Arc::new(transport.clone()));
        let route = Arc::new(
            Route::builder(RoutePattern::RequestReply, "orders.get")
                .reply_builder(reply::passthrough())
                .build()
                .unwrap(),
        );
        let handler: SharedHandler = Arc::new(handler_fn(|delivery: Delivery| async move {
            if delivery.payload == "explode" {
                panic!("kaboom");
            }
            Ok(Some(Bytes::from_static(b"fine")))
        }));
        let cancel = CancellationToken::new();
        dispatcher.start(cancel.clone(), route, handler).await.unwrap();

        let reply = transport
            .request(OutboundMessage::new("orders.get", "explode"), WAIT)
            .await
            .unwrap();
        assert_eq!(reply.payload, "handler panicked: kaboom");
        assert_eq!(reply.headers.get(HEADER_STATUS), Some("error"));

        let reply = transport
            .request(OutboundMessage::new("orders.get", "again"), WAIT)
            .await
            .unwrap();
        assert_eq!(reply.payload, "fine");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_handler_timeout_becomes_error() {
        let transport = MemoryTransport::new();
        let dispatcher = Dispatcher::new(Arc::new(transport.clone()));
        let route = Arc::new(
            Route::builder(RoutePattern::RequestReply, "orders.slow")
                .reply_builder(reply::passthrough())
                .handler_timeout(Duration::from_millis(50))
                .build()
                .unwrap(),
        );
        let handler: SharedHandler = Arc::new(handler_fn(|_| async {
            sleep(Duration::from_secs(5)).await;
            Ok(None)
        }));
        let cancel = CancellationToken::new();
        dispatcher.start(cancel.clone(), route, handler).await.unwrap();

        let reply = transport
            .request(OutboundMessage::new("orders.slow", ""), WAIT)
            .await
            .unwrap();
        assert_eq!(reply.payload, "handler timed out after 50ms");
        cancel.cancel();
    }
}

mod fan_out {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_workers_each_receive_every_message() {
        let transport = MemoryTransport::new();
        let dispatcher = Dispatcher::new(Arc::new(transport.clone()));
        let route = Arc::new(Route::new(RoutePattern::Broadcast, "events.user").unwrap());
        let (handler, seen) = CountingHandler::recording();
        let cancel = CancellationToken::new();

        dispatcher.start(cancel.clone(), route.clone(), handler.clone()).await.unwrap();
        dispatcher.start(cancel.clone(), route, handler).await.unwrap();

        for i in 0..3 {
            transport
                .publish(OutboundMessage::new("events.user", format!("{i}")))
                .await
                .unwrap();
        }

        assert!(wait_until(|| seen.lock().len() == 6).await);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_queue_workers_share_messages() {
        let transport = MemoryTransport::new();
        let dispatcher = Dispatcher::new(Arc::new(transport.clone()));
        let route = Arc::new(
            Route::builder(RoutePattern::Queue, "orders.created")
                .queue_group("order-workers")
                .build()
                .unwrap(),
        );
        let (handler, seen) = CountingHandler::recording();
        let cancel = CancellationToken::new();

        dispatcher.start(cancel.clone(), route.clone(), handler.clone()).await.unwrap();
        dispatcher.start(cancel.clone(), route, handler).await.unwrap();

        for i in 0..10 {
            transport
                .publish(OutboundMessage::new("orders.created", format!("{i}")))
                .await
                .unwrap();
        }

        assert!(wait_until(|| seen.lock().len() == 10).await);
        sleep(Duration::from_millis(50)).await;
        let mut payloads: Vec<String> = seen
            .lock()
            .iter()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .collect();
        payloads.sort_by_key(|p| p.parse::<u32>().unwrap());
        assert_eq!(payloads, (0..10).map(|i| i.to_string()).collect::<Vec<_>>());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_handler_errors_do_not_stop_the_route() {
        let transport = MemoryTransport::new();
        let dispatcher = Dispatcher::new(Arc::new(transport.clone()));
        let route = Arc::new(Route::new(RoutePattern::Broadcast, "events.user").unwrap());
        let (handler, calls) = CountingHandler::failing();
        let cancel = CancellationToken::new();
        dispatcher.start(cancel.clone(), route, handler).await.unwrap();

        for _ in 0..3 {
            transport
                .publish(OutboundMessage::new("events.user", "x"))
                .await
                .unwrap();
        }

        let counter = CountingHandler { calls };
        assert!(wait_until(|| counter.calls() == 3).await);
        cancel.cancel();
    }
}

mod durable_stream {
    use super::*;

    #[tokio::test]
    async fn test_success_acks_message() {
        let transport = orders_transport();
        let dispatcher = Dispatcher::new(Arc::new(transport.clone()));
        let (handler, seen) = CountingHandler::recording();
        let cancel = CancellationToken::new();
        dispatcher.start(cancel.clone(), durable_route(3, false), handler).await.unwrap();

        transport
            .publish(OutboundMessage::new("orders.created", "order-1"))
            .await
            .unwrap();

        assert!(wait_until(|| seen.lock().len() == 1).await);
        assert!(wait_until(|| transport.consumer_pending("ORDERS", "order-processor") == Some(0)).await);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_single_attempt_is_dead_lettered_once() {
        let transport = orders_transport();
        let mut dlq = transport.subscribe("dlq.orders.created", None).await.unwrap();
        let dispatcher = Dispatcher::new(Arc::new(transport.clone()));
        let (handler, calls) = CountingHandler::failing();
        let cancel = CancellationToken::new();
        dispatcher.start(cancel.clone(), durable_route(1, true), handler).await.unwrap();

        transport
            .publish(OutboundMessage::new("orders.created", "order-1"))
            .await
            .unwrap();

        let envelope = timeout(WAIT, dlq.next()).await.unwrap().unwrap();
        assert_eq!(envelope.subject, "dlq.orders.created");
        assert_eq!(envelope.payload, "order-1");
        assert_eq!(envelope.headers.get(HEADER_RETRY_COUNT), Some("1"));
        assert_eq!(envelope.headers.get(HEADER_ERROR), Some("processing failed"));

        assert!(timeout(Duration::from_millis(200), dlq.next()).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(wait_until(|| transport.consumer_pending("ORDERS", "order-processor") == Some(0)).await);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_dead_letter_after_max_deliver_attempts() {
        let transport = orders_transport();
        let mut dlq = transport.subscribe("dlq.orders.created", None).await.unwrap();
        let dispatcher = Dispatcher::new(Arc::new(transport.clone()));
        let (handler, calls) = CountingHandler::failing();
        let cancel = CancellationToken::new();
        dispatcher.start(cancel.clone(), durable_route(3, true), handler).await.unwrap();

        transport
            .publish(OutboundMessage::new("orders.created", "order-1"))
            .await
            .unwrap();

        let envelope = timeout(WAIT, dlq.next()).await.unwrap().unwrap();
        assert_eq!(envelope.headers.get(HEADER_RETRY_COUNT), Some("3"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(timeout(Duration::from_millis(200), dlq.next()).await.is_err());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_without_dead_letter_nothing_is_republished() {
        let transport = orders_transport();
        let mut dlq = transport.subscribe("dlq.>", None).await.unwrap();
        let dispatcher = Dispatcher::new(Arc::new(transport.clone()));
        let (handler, calls) = CountingHandler::failing();
        let cancel = CancellationToken::new();
        dispatcher.start(cancel.clone(), durable_route(3, false), handler).await.unwrap();

        transport
            .publish(OutboundMessage::new("orders.created", "order-1"))
            .await
            .unwrap();

        let counter = CountingHandler { calls };
        assert!(wait_until(|| counter.calls() == 3).await);
        assert!(timeout(Duration::from_millis(200), dlq.next()).await.is_err());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_panic_counts_as_a_failed_delivery() {
        let transport = orders_transport();
        let mut dlq = transport.subscribe("dlq.orders.created", None).await.unwrap();
        let dispatcher = Dispatcher::new(Arc::new(transport.clone()));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let handler: SharedHandler = Arc::new(handler_fn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { explode("corrupt order") }
        }));
        let cancel = CancellationToken::new();
        dispatcher.start(cancel.clone(), durable_route(2, true), handler).await.unwrap();

        transport
            .publish(OutboundMessage::new("orders.created", "order-1"))
            .await
            .unwrap();

        let envelope = timeout(WAIT, dlq.next()).await.unwrap().unwrap();
        assert_eq!(envelope.headers.get(HEADER_RETRY_COUNT), Some("2"));
        assert_eq!(envelope.headers.get(HEADER_ERROR), Some("handler panicked: corrupt order"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_delivery_count_is_visible_to_handler() {
        let transport = orders_transport();
        let dispatcher = Dispatcher::new(Arc::new(transport.clone()));
        let counts = Arc::new(Mutex::new(Vec::new()));
        let recorder = counts.clone();
        let handler: SharedHandler = Arc::new(handler_fn(move |delivery: Delivery| {
            recorder.lock().push(delivery.num_delivered);
            let attempt = delivery.num_delivered.unwrap_or(0);
            async move {
                if attempt < 2 {
                    Err(HandlerError::new("not yet"))
                } else {
                    Ok(None)
                }
            }
        }));
        let cancel = CancellationToken::new();
        dispatcher.start(cancel.clone(), durable_route(5, false), handler).await.unwrap();

        transport
            .publish(OutboundMessage::new("orders.created", "order-1"))
            .await
            .unwrap();

        assert!(wait_until(|| counts.lock().len() == 2).await);
        assert!(wait_until(|| transport.consumer_pending("ORDERS", "order-processor") == Some(0)).await);
        assert_eq!(*counts.lock(), vec![Some(1), Some(2)]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_missing_stream_fails_to_start() {
        let transport = MemoryTransport::new();
        let dispatcher = Dispatcher::new(Arc::new(transport));
        let result = dispatcher
            .start(CancellationToken::new(), durable_route(3, false), ok_handler())
            .await;
        assert!(matches!(result, Err(TransportError::StreamNotFound(_))));
    }
}

mod shutdown {
    use super::*;

    #[tokio::test]
    async fn test_cancel_drains_and_finishes_buffered_messages() {
        let transport = MemoryTransport::new();
        let dispatcher = Dispatcher::new(Arc::new(transport.clone()));
        let route = Arc::new(
            Route::builder(RoutePattern::Queue, "orders.created")
                .queue_group("order-workers")
                .build()
                .unwrap(),
        );
        let (handler, seen) = CountingHandler::recording();
        let cancel = CancellationToken::new();
        let task = dispatcher.start(cancel.clone(), route, handler).await.unwrap();
        assert_eq!(transport.subscriber_count(), 1);

        for i in 0..5 {
            transport
                .publish(OutboundMessage::new("orders.created", format!("{i}")))
                .await
                .unwrap();
        }
        cancel.cancel();

        timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(seen.lock().len(), 5);
        assert_eq!(transport.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_stops_durable_consumer() {
        let transport = orders_transport();
        let dispatcher = Dispatcher::new(Arc::new(transport.clone()));
        let cancel = CancellationToken::new();
        let task = dispatcher
            .start(cancel.clone(), durable_route(3, false), ok_handler())
            .await
            .unwrap();

        cancel.cancel();
        timeout(WAIT, task).await.unwrap().unwrap();
    }
}
