//! Typed adapters around the byte-oriented core.
//!
//! Dispatch stays on raw bytes. A [`Codec`] converts at the edges: handlers
//! built with [`typed_handler`] see decoded values, and [`TypedProducer`] /
//! [`TypedRequester`] encode before handing bytes to a [`Producer`].

use crate::error::{CodecError, HandlerError, ProducerError};
use crate::handler::{Delivery, Handler, HandlerResult};
use crate::producer::{Producer, PublishOptions};
use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;

/// Converts `T` to and from bytes
pub trait Codec<T>: Send + Sync + 'static {
    fn encode(&self, value: &T) -> Result<Bytes, CodecError>;
    fn decode(&self, data: &[u8]) -> Result<T, CodecError>;
}

/// JSON via `serde_json`
pub struct JsonCodec<T> {
    _type: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self { _type: PhantomData }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> Codec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn encode(&self, value: &T) -> Result<Bytes, CodecError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, data: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(data).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// Handler produced by [`typed_handler`]
pub struct TypedHandler<T, R, D, E, F> {
    decoder: D,
    encoder: E,
    f: F,
    _types: PhantomData<fn(T) -> R>,
}

/// Adapt a function over decoded values into a byte [`Handler`].
///
/// The payload is decoded with `decoder` before `f` runs; if that fails `f`
/// is not called and the invocation fails with [`HandlerError::Decode`]. The
/// result is encoded with `encoder`.
pub fn typed_handler<T, R, D, E, F, Fut>(decoder: D, encoder: E, f: F) -> TypedHandler<T, R, D, E, F>
where
    T: Send + 'static,
    R: Send + 'static,
    D: Codec<T>,
    E: Codec<R>,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
{
    TypedHandler {
        decoder,
        encoder,
        f,
        _types: PhantomData,
    }
}

#[async_trait]
impl<T, R, D, E, F, Fut> Handler for TypedHandler<T, R, D, E, F>
where
    T: Send + 'static,
    R: Send + 'static,
    D: Codec<T>,
    E: Codec<R>,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
{
    async fn handle(&self, delivery: Delivery) -> HandlerResult {
        let input = self
            .decoder
            .decode(&delivery.payload)
            .map_err(|e| HandlerError::Decode(e.to_string()))?;

        let output = (self.f)(input).await?;

        let bytes = self
            .encoder
            .encode(&output)
            .map_err(|e| HandlerError::Encode(e.to_string()))?;
        Ok(Some(bytes))
    }
}

/// Publishes encoded values of `T`
pub struct TypedProducer<T, C> {
    producer: Producer,
    codec: C,
    _type: PhantomData<fn(&T)>,
}

impl<T, C: Codec<T>> TypedProducer<T, C> {
    pub fn new(producer: Producer, codec: C) -> Self {
        Self {
            producer,
            codec,
            _type: PhantomData,
        }
    }

    pub fn producer(&self) -> &Producer {
        &self.producer
    }

    pub async fn publish(&self, value: &T, options: PublishOptions) -> Result<(), ProducerError> {
        let payload = self
            .codec
            .encode(value)
            .map_err(|e| ProducerError::Encode(e.to_string()))?;
        self.producer.publish(payload, options).await
    }
}

/// Sends encoded `T` requests and decodes `R` replies
pub struct TypedRequester<T, R, E, D> {
    producer: Producer,
    encoder: E,
    decoder: D,
    _types: PhantomData<fn(&T) -> R>,
}

impl<T, R, E, D> TypedRequester<T, R, E, D>
where
    E: Codec<T>,
    D: Codec<R>,
{
    pub fn new(producer: Producer, encoder: E, decoder: D) -> Self {
        Self {
            producer,
            encoder,
            decoder,
            _types: PhantomData,
        }
    }

    pub async fn request(&self, value: &T, timeout: Duration) -> Result<R, ProducerError> {
        let payload = self
            .encoder
            .encode(value)
            .map_err(|e| ProducerError::EncodeRequest(e.to_string()))?;

        let reply = self.producer.request(payload, timeout).await?;

        self.decoder
            .decode(&reply)
            .map_err(|e| ProducerError::DecodeResponse(e.to_string()))
    }
}
