//! Producer and typed adapter tests

use std::sync::Arc;
use std::time::Duration;

use nr_common::{OutboundMessage, HEADER_MSG_ID};
use nr_router::{
    handler_fn, typed_handler, Codec, CodecError, Delivery, Dispatcher, HandlerError, JsonCodec, Producer,
    ProducerError, PublishOptions, Route, RouteError, RoutePattern, TypedProducer, TypedRequester,
};
use nr_transport::{MemoryTransport, Subscription, Transport, TransportError};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct PriceQuery {
    sku: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Price {
    sku: String,
    cents: u64,
}

/// Codec that always fails to encode
struct BrokenCodec;

impl Codec<PriceQuery> for BrokenCodec {
    fn encode(&self, _value: &PriceQuery) -> Result<bytes::Bytes, CodecError> {
        Err(CodecError::Encode("unsupported".to_string()))
    }

    fn decode(&self, _data: &[u8]) -> Result<PriceQuery, CodecError> {
        Err(CodecError::Decode("unsupported".to_string()))
    }
}

#[tokio::test]
async fn test_empty_subject_is_rejected() {
    let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
    assert!(matches!(
        Producer::new(transport, ""),
        Err(ProducerError::Route(RouteError::MissingSubject))
    ));
}

#[tokio::test]
async fn test_publish_sets_message_id_and_headers() {
    let transport = MemoryTransport::new();
    let mut sub = transport.subscribe("orders.created", None).await.unwrap();
    let producer = Producer::new(Arc::new(transport.clone()), "orders.created").unwrap();

    producer
        .publish(
            "order-1",
            PublishOptions::new().with_header("X-Source", "checkout").with_msg_id("order-1"),
        )
        .await
        .unwrap();

    let message = timeout(WAIT, sub.next()).await.unwrap().unwrap();
    assert_eq!(message.payload, "order-1");
    assert_eq!(message.headers.get(HEADER_MSG_ID), Some("order-1"));
    assert_eq!(message.headers.get("X-Source"), Some("checkout"));
}

#[tokio::test]
async fn test_message_id_deduplicates_within_stream_window() {
    let transport = MemoryTransport::new();
    transport.add_stream("ORDERS", ["orders.>"], Duration::from_secs(120));
    let producer = Producer::new(Arc::new(transport.clone()), "orders.created").unwrap();

    for _ in 0..3 {
        producer
            .publish("order-1", PublishOptions::new().with_msg_id("order-1"))
            .await
            .unwrap();
    }
    producer
        .publish("order-2", PublishOptions::new().with_generated_msg_id())
        .await
        .unwrap();

    assert_eq!(transport.stream_len("ORDERS"), Some(2));
}

#[tokio::test]
async fn test_publish_error_is_surfaced() {
    let transport = MemoryTransport::new();
    transport.deny_publish("orders.>");
    let producer = Producer::new(Arc::new(transport), "orders.created").unwrap();

    let result = producer.publish("x", PublishOptions::default()).await;
    assert!(matches!(
        result,
        Err(ProducerError::Transport(TransportError::Publish { .. }))
    ));
}

#[tokio::test]
async fn test_request_without_responders() {
    let transport = MemoryTransport::new();
    let producer = Producer::new(Arc::new(transport), "prices.get").unwrap();

    let result = producer.request("x", WAIT).await;
    assert!(matches!(
        result,
        Err(ProducerError::Transport(TransportError::NoResponders(_)))
    ));
}

#[tokio::test]
async fn test_typed_request_reply_round_trip() {
    let transport = MemoryTransport::new();
    let cancel = CancellationToken::new();
    let route = Route::builder(RoutePattern::RequestReply, "prices.get")
        .queue_group("pricing")
        .reply_builder(nr_router::reply::passthrough())
        .build()
        .unwrap();
    let handler = typed_handler(
        JsonCodec::<PriceQuery>::new(),
        JsonCodec::<Price>::new(),
        |query: PriceQuery| async move {
            if query.sku == "unknown" {
                return Err(HandlerError::new("no such sku"));
            }
            Ok(Price {
                sku: query.sku,
                cents: 1299,
            })
        },
    );
    Dispatcher::new(Arc::new(transport.clone()))
        .start(cancel.clone(), Arc::new(route), Arc::new(handler))
        .await
        .unwrap();

    let producer = Producer::new(Arc::new(transport.clone()), "prices.get").unwrap();
    let requester = TypedRequester::new(producer, JsonCodec::<PriceQuery>::new(), JsonCodec::<Price>::new());

    let price = requester
        .request(&PriceQuery { sku: "BOOK-1".to_string() }, WAIT)
        .await
        .unwrap();
    assert_eq!(
        price,
        Price {
            sku: "BOOK-1".to_string(),
            cents: 1299
        }
    );

    // The error text is not valid JSON for the response type
    let result = requester
        .request(&PriceQuery { sku: "unknown".to_string() }, WAIT)
        .await;
    assert!(matches!(result, Err(ProducerError::DecodeResponse(_))));

    cancel.cancel();
}

#[tokio::test]
async fn test_typed_encode_errors_are_labelled() {
    let transport = MemoryTransport::new();
    let producer = Producer::new(Arc::new(transport.clone()), "prices.get").unwrap();

    let typed = TypedProducer::new(producer.clone(), BrokenCodec);
    let result = typed
        .publish(&PriceQuery { sku: "x".to_string() }, PublishOptions::default())
        .await;
    assert!(matches!(result, Err(ProducerError::Encode(_))));

    let requester = TypedRequester::new(producer, BrokenCodec, JsonCodec::<Price>::new());
    let result = requester.request(&PriceQuery { sku: "x".to_string() }, WAIT).await;
    assert!(matches!(result, Err(ProducerError::EncodeRequest(_))));
}

#[tokio::test]
async fn test_typed_producer_publishes_json() {
    let transport = MemoryTransport::new();
    let mut sub = transport.subscribe("prices.updated", None).await.unwrap();
    let producer = Producer::new(Arc::new(transport.clone()), "prices.updated").unwrap();
    let typed = TypedProducer::new(producer, JsonCodec::<Price>::new());

    typed
        .publish(
            &Price {
                sku: "BOOK-1".to_string(),
                cents: 999,
            },
            PublishOptions::default(),
        )
        .await
        .unwrap();

    let message = timeout(WAIT, sub.next()).await.unwrap().unwrap();
    let price: Price = serde_json::from_slice(&message.payload).unwrap();
    assert_eq!(price.cents, 999);
}

#[tokio::test]
async fn test_plain_handler_sees_published_payload() {
    let transport = MemoryTransport::new();
    let cancel = CancellationToken::new();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let handler = handler_fn(move |delivery: Delivery| {
        let _ = tx.send(delivery.payload);
        async { Ok(None) }
    });
    Dispatcher::new(Arc::new(transport.clone()))
        .start(
            cancel.clone(),
            Arc::new(Route::new(RoutePattern::Broadcast, "audit.>").unwrap()),
            Arc::new(handler),
        )
        .await
        .unwrap();

    transport
        .publish(OutboundMessage::new("audit.login", "user-7"))
        .await
        .unwrap();

    assert_eq!(timeout(WAIT, rx.recv()).await.unwrap().unwrap(), "user-7");
    cancel.cancel();
}
