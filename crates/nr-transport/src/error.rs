use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connect(String),

    #[error("Subscribe to '{subject}' failed: {reason}")]
    Subscribe { subject: String, reason: String },

    #[error("Publish to '{subject}' failed: {reason}")]
    Publish { subject: String, reason: String },

    #[error("Request to '{subject}' failed: {reason}")]
    Request { subject: String, reason: String },

    #[error("No responders available for request on '{0}'")]
    NoResponders(String),

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Consumer error: {0}")]
    Consumer(String),

    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    #[error("Acknowledgement failed: {0}")]
    Ack(String),

    #[error("Transport is closed")]
    Closed,
}
