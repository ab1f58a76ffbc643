//! NATS JetStream transport
//!
//! Topics are subjects of a single stream. Each consumer group is a durable
//! pull consumer filtered on its topic with explicit acks, so a nacked or
//! unacked message is redelivered by the server.

use async_nats::jetstream::{
    self,
    consumer::{pull::Config as PullConfig, AckPolicy},
    stream::{Config as StreamConfig, RetentionPolicy, StorageType},
    AckKind, Context,
};
use async_nats::HeaderMap;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use tallyline_common::{Result, TallyError};
use tracing::{debug, info};

use super::{
    Acker, Delivery, Message, MessageStream, Publisher, Subscriber, META_ENVIRONMENT_ID, META_PARTITION_KEY,
    META_TENANT_ID,
};

/// Header carrying the message UUID; JetStream also dedups on it
const HEADER_MSG_ID: &str = "Nats-Msg-Id";

/// Metadata keys carried as headers
const METADATA_HEADERS: [&str; 3] = [META_TENANT_ID, META_ENVIRONMENT_ID, META_PARTITION_KEY];

fn transport_err(context: &str, e: impl std::fmt::Display) -> TallyError {
    TallyError::Transport(format!("{}: {}", context, e))
}

/// Publisher and subscriber over one JetStream stream
pub struct NatsTransport {
    jetstream: Context,
    stream_name: String,
}

impl NatsTransport {
    /// Connect and make sure the stream covers `subjects`
    pub async fn connect(url: &str, stream_name: &str, subjects: Vec<String>) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| transport_err("connect to NATS", e))?;
        let jetstream = jetstream::new(client);

        jetstream
            .get_or_create_stream(StreamConfig {
                name: stream_name.to_string(),
                subjects: subjects.clone(),
                retention: RetentionPolicy::Limits,
                storage: StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| transport_err("create stream", e))?;

        info!(url, stream = stream_name, subjects = ?subjects, "Connected to NATS JetStream");
        Ok(Self {
            jetstream,
            stream_name: stream_name.to_string(),
        })
    }

    fn headers(message: &Message) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_MSG_ID, message.uuid.as_str());
        for key in METADATA_HEADERS {
            if let Some(value) = message.metadata(key) {
                headers.insert(key, value);
            }
        }
        headers
    }

    fn decode(message: &jetstream::Message) -> Message {
        let mut metadata = HashMap::new();
        let mut uuid = String::new();
        if let Some(headers) = &message.headers {
            if let Some(id) = headers.get(HEADER_MSG_ID) {
                uuid = id.to_string();
            }
            for key in METADATA_HEADERS {
                if let Some(value) = headers.get(key) {
                    metadata.insert(key.to_string(), value.to_string());
                }
            }
        }
        Message {
            uuid,
            payload: message.payload.clone(),
            metadata,
        }
    }
}

/// Durable consumer names may not contain dots
fn durable_name(consumer_group: &str) -> String {
    consumer_group.replace(['.', ' ', '*', '>'], "_")
}

#[async_trait]
impl Publisher for NatsTransport {
    async fn publish(&self, topic: &str, message: Message) -> Result<()> {
        let ack = self
            .jetstream
            .publish_with_headers(topic.to_string(), Self::headers(&message), message.payload.clone())
            .await
            .map_err(|e| transport_err("publish", e))?;
        ack.await.map_err(|e| transport_err("publish ack", e))?;
        debug!(topic, message_uuid = %message.uuid, "Published message");
        Ok(())
    }
}

#[async_trait]
impl Subscriber for NatsTransport {
    async fn subscribe(&self, topic: &str, consumer_group: &str) -> Result<Box<dyn MessageStream>> {
        let stream = self
            .jetstream
            .get_stream(&self.stream_name)
            .await
            .map_err(|e| transport_err("get stream", e))?;

        let durable = durable_name(consumer_group);
        let consumer = stream
            .get_or_create_consumer(
                &durable,
                PullConfig {
                    durable_name: Some(durable.clone()),
                    filter_subject: topic.to_string(),
                    ack_policy: AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| transport_err("create consumer", e))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| transport_err("open message stream", e))?;

        info!(topic, consumer = %durable, "Subscribed");
        Ok(Box::new(NatsStream { messages }))
    }
}

struct NatsStream {
    messages: async_nats::jetstream::consumer::pull::Stream,
}

#[async_trait]
impl MessageStream for NatsStream {
    async fn next(&mut self) -> Option<Result<Delivery>> {
        let next = self.messages.next().await?;
        Some(
            next.map(|raw| {
                let message = NatsTransport::decode(&raw);
                Delivery::new(message, Box::new(NatsAcker { raw }))
            })
            .map_err(|e| transport_err("pull message", e)),
        )
    }
}

struct NatsAcker {
    raw: jetstream::Message,
}

#[async_trait]
impl Acker for NatsAcker {
    async fn ack(&self) -> Result<()> {
        self.raw.ack().await.map_err(|e| transport_err("ack", e))
    }

    async fn nack(&self) -> Result<()> {
        self.raw
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| transport_err("nak", e))
    }
}
