//! NatsRoute Message Router
//!
//! This crate provides declarative routing of subject-based messages to handlers:
//! - Route: Validated, immutable description of one subscription and its pattern
//! - Dispatcher: Per-pattern delivery engine (broadcast, queue, request/reply, durable stream)
//! - Broker: Runs many routes with worker pools under one cancellation token
//! - Reply builders and header propagation for request/reply routes
//! - Instrumentation: Handler decorator feeding the `metrics` facade
//! - Codec: Typed adapters around the byte-oriented core
//! - Producer: Publishing and requesting on a subject

pub mod broker;
pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod headers;
pub mod instrument;
pub mod metrics;
pub mod producer;
pub mod reply;
pub mod route;

pub use broker::{Broker, BrokerConfig, RouteRegistration, RouteRegistrationBuilder, DEFAULT_DRAIN_TIMEOUT, DEFAULT_WORKERS};
pub use codec::{typed_handler, Codec, JsonCodec, TypedHandler, TypedProducer, TypedRequester};
pub use dispatcher::Dispatcher;
pub use error::{BrokerError, CodecError, HandlerError, ProducerError, ReplyError, RouteError};
pub use handler::{handler_fn, Delivery, Handler, HandlerFn, HandlerResult, SharedHandler};
pub use headers::{propagate_headers, PROPAGATED_HEADERS};
pub use instrument::instrument;
pub use metrics::{BrokerMetrics, SubjectStats};
pub use producer::{Producer, PublishOptions};
pub use reply::{Reply, ReplyBuilder, ReplyStatus};
pub use route::{
    DurableSettings, Route, RouteBuilder, RouteKind, RoutePattern, DEAD_LETTER_PREFIX, DEFAULT_ACK_WAIT,
    DEFAULT_MAX_DELIVER,
};

// Re-export transport types used in route definitions
pub use nr_transport::DeliverPolicy;
