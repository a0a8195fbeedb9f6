use nr_transport::TransportError;
use std::time::Duration;
use thiserror::Error;

/// Route construction and validation failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("subject is required")]
    MissingSubject,

    #[error("queue group is required for queue routes")]
    MissingQueueGroup,

    #[error("stream is required for durable stream routes")]
    MissingStream,

    #[error("durable name is required for durable stream routes")]
    MissingDurableName,

    #[error("unsupported route pattern: {0}")]
    UnsupportedPattern(String),

    #[error("invalid deliver policy: {0}")]
    InvalidDeliverPolicy(String),
}

/// Failures that stop the broker
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("no routes registered")]
    NoRoutes,

    #[error("route registration cannot be nil")]
    NilRegistration,

    #[error("route cannot be nil")]
    NilRoute,

    #[error("handler cannot be nil")]
    NilHandler,

    #[error("route '{subject}' failed to start: {source}")]
    Start {
        subject: String,
        #[source]
        source: TransportError,
    },
}

/// A failed handler invocation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("{message}")]
    Failed {
        message: String,
        code: Option<String>,
    },

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("handler timed out after {0:?}")]
    Timeout(Duration),

    #[error("decode: {0}")]
    Decode(String),

    #[error("encode: {0}")]
    Encode(String),
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        HandlerError::Failed {
            message: message.into(),
            code: None,
        }
    }

    /// An error carrying a machine-readable code, surfaced as `X-Error-Code` by JSON replies
    pub fn with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        HandlerError::Failed {
            message: message.into(),
            code: Some(code.into()),
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            HandlerError::Failed { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError::new(message)
    }
}

/// A reply builder could not produce a reply
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplyError {
    #[error("reply build failed: {0}")]
    Build(String),

    #[error("reply encode failed: {0}")]
    Encode(String),
}

/// Producer side failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProducerError {
    #[error(transparent)]
    Route(#[from] RouteError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("encode: {0}")]
    Encode(String),

    #[error("encode request: {0}")]
    EncodeRequest(String),

    #[error("decode response: {0}")]
    DecodeResponse(String),
}

/// A value could not be converted to or from bytes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),
}
