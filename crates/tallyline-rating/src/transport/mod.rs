//! Message transport
//!
//! An opaque at-least-once queue: publishers put [`Message`]s on topics,
//! subscribers pull [`Delivery`]s per consumer group and either ack or nack
//! them. The [`Router`] runs one rate-limited consumer lane per registered
//! handler.

pub mod memory;
pub mod nats;
pub mod router;

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use tallyline_common::Result;
use uuid::Uuid;

pub use memory::InMemoryBus;
pub use nats::NatsTransport;
pub use router::{HandlerConfig, Router, RouterHandle};

/// Metadata key carrying the tenant the message belongs to
pub const META_TENANT_ID: &str = "tenant_id";
/// Metadata key carrying the environment the message belongs to
pub const META_ENVIRONMENT_ID: &str = "environment_id";
/// Metadata key carrying the ordering key
pub const META_PARTITION_KEY: &str = "partition_key";

/// Transport message
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Unique per publish, not per payload
    pub uuid: String,
    pub payload: Bytes,
    pub metadata: HashMap<String, String>,
}

impl Message {
    /// New message with a fresh v4 UUID
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            payload: payload.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn partition_key(&self) -> Option<&str> {
        self.metadata(META_PARTITION_KEY)
    }
}

/// Puts messages on a topic
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, message: Message) -> Result<()>;
}

/// Opens consumer streams on a topic
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn subscribe(&self, topic: &str, consumer_group: &str) -> Result<Box<dyn MessageStream>>;
}

/// Stream of deliveries for one consumer group
#[async_trait]
pub trait MessageStream: Send {
    /// Next delivery, `None` once the stream is closed
    async fn next(&mut self) -> Option<Result<Delivery>>;
}

/// Settles a delivery with the broker
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<()>;
    /// Ask the broker to redeliver
    async fn nack(&self) -> Result<()>;
}

/// A message handed to a consumer together with its settlement handle
pub struct Delivery {
    pub message: Message,
    pub acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(message: Message, acker: Box<dyn Acker>) -> Self {
        Self { message, acker }
    }
}

/// Consumes one message.
///
/// `Ok` acknowledges the message, `Err` leaves it for redelivery.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<()>;
}
