//! Broker-facing types.
//!
//! This module contains:
//! - `Envelope`: one inbound broker message (settlement handle + body)
//! - `Body`: raw or pre-decoded message payload
//! - `Acknowledger` trait: broker-level ack / requeue for a single message
//! - Implementations: AMQP (RabbitMQ), Mock

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod mock;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::{AmqpConsumer, AmqpConsumerConfig};
pub use mock::MockAcknowledger;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Settle failed: {0}")]
    Settle(String),
}

/// Message body could not be turned into JSON.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("body is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Payload of an inbound message.
///
/// Brokers hand over raw bytes; in-process producers and tests may pass text
/// or an already-decoded document.
#[derive(Debug, Clone)]
pub enum Body {
    Bytes(Bytes),
    Text(String),
    Json(Value),
}

impl Body {
    /// Decode into a JSON document.
    pub fn decode(self) -> std::result::Result<Value, DecodeError> {
        match self {
            Body::Bytes(bytes) => {
                let text = std::str::from_utf8(&bytes)?;
                Ok(serde_json::from_str(text)?)
            }
            Body::Text(text) => Ok(serde_json::from_str(&text)?),
            Body::Json(value) => Ok(value),
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(data: Vec<u8>) -> Self {
        Body::Bytes(Bytes::from(data))
    }
}

impl From<&str> for Body {
    fn from(text: &str) -> Self {
        Body::Text(text.to_string())
    }
}

impl From<Value> for Body {
    fn from(value: Value) -> Self {
        Body::Json(value)
    }
}

/// Broker-level settlement of a single delivered message.
///
/// Implementations:
/// - `AmqpAcknowledger`: RabbitMQ `basic.ack` / `basic.nack(requeue)`
/// - `MockAcknowledger`: Records outcomes for testing
#[async_trait]
pub trait Acknowledger: Send + Sync + 'static {
    /// Mark the message consumed.
    async fn ack(&self) -> Result<()>;

    /// Return the message to the queue for redelivery.
    async fn requeue(&self) -> Result<()>;
}

/// One broker-delivered message.
///
/// Owned by the queue processor from arrival until settlement; never persisted.
#[derive(Debug)]
pub struct Envelope<A> {
    /// Transport handle used to settle the message with the broker.
    pub handle: A,
    /// Message payload.
    pub body: Body,
}

impl<A: Acknowledger> Envelope<A> {
    pub fn new(handle: A, body: impl Into<Body>) -> Self {
        Self {
            handle,
            body: body.into(),
        }
    }
}
