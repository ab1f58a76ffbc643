//! In-process transport
//!
//! Each (topic, consumer group) pair gets its own queue. Consumers in the
//! same group compete for messages; a group created after messages were
//! published starts from the beginning of the topic. Nacked messages go back
//! on the group's queue.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tallyline_common::{Result, TallyError};
use tokio::sync::mpsc;
use tracing::debug;

use super::{Acker, Delivery, Message, MessageStream, Publisher, Subscriber};

struct GroupQueue {
    tx: mpsc::UnboundedSender<Message>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>>,
}

impl GroupQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }
}

#[derive(Default)]
struct Topic {
    log: Vec<Message>,
    groups: HashMap<String, GroupQueue>,
}

#[derive(Default)]
struct Counters {
    acks: AtomicU64,
    nacks: AtomicU64,
}

/// In-memory at-least-once bus
#[derive(Default)]
pub struct InMemoryBus {
    topics: Mutex<HashMap<String, Topic>>,
    counters: Arc<Counters>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message ever published on `topic`, in publish order
    pub fn published(&self, topic: &str) -> Vec<Message> {
        self.topics
            .lock()
            .get(topic)
            .map(|t| t.log.clone())
            .unwrap_or_default()
    }

    pub fn ack_count(&self) -> u64 {
        self.counters.acks.load(Ordering::Relaxed)
    }

    pub fn nack_count(&self) -> u64 {
        self.counters.nacks.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Publisher for InMemoryBus {
    async fn publish(&self, topic: &str, message: Message) -> Result<()> {
        let mut topics = self.topics.lock();
        let entry = topics.entry(topic.to_string()).or_default();
        for (group, queue) in &entry.groups {
            if queue.tx.send(message.clone()).is_err() {
                debug!(topic, group = %group, "Consumer group queue closed");
            }
        }
        entry.log.push(message);
        Ok(())
    }
}

#[async_trait]
impl Subscriber for InMemoryBus {
    async fn subscribe(&self, topic: &str, consumer_group: &str) -> Result<Box<dyn MessageStream>> {
        let mut topics = self.topics.lock();
        let entry = topics.entry(topic.to_string()).or_default();

        if !entry.groups.contains_key(consumer_group) {
            let queue = GroupQueue::new();
            for message in &entry.log {
                queue
                    .tx
                    .send(message.clone())
                    .map_err(|e| TallyError::Transport(format!("replay to {}: {}", consumer_group, e)))?;
            }
            entry.groups.insert(consumer_group.to_string(), queue);
        }

        let Some(queue) = entry.groups.get(consumer_group) else {
            return Err(TallyError::Internal(format!("consumer group {} missing", consumer_group)));
        };
        Ok(Box::new(MemoryStream {
            requeue: queue.tx.clone(),
            rx: queue.rx.clone(),
            counters: self.counters.clone(),
        }))
    }
}

struct MemoryStream {
    requeue: mpsc::UnboundedSender<Message>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>>,
    counters: Arc<Counters>,
}

#[async_trait]
impl MessageStream for MemoryStream {
    async fn next(&mut self) -> Option<Result<Delivery>> {
        let message = self.rx.lock().await.recv().await?;
        let acker = MemoryAcker {
            message: message.clone(),
            requeue: self.requeue.clone(),
            counters: self.counters.clone(),
        };
        Some(Ok(Delivery::new(message, Box::new(acker))))
    }
}

struct MemoryAcker {
    message: Message,
    requeue: mpsc::UnboundedSender<Message>,
    counters: Arc<Counters>,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.counters.acks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn nack(&self) -> Result<()> {
        self.counters.nacks.fetch_add(1, Ordering::Relaxed);
        self.requeue
            .send(self.message.clone())
            .map_err(|e| TallyError::Transport(format!("requeue {}: {}", self.message.uuid, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn msg(body: &'static str) -> Message {
        Message::new(Bytes::from_static(body.as_bytes()))
    }

    #[tokio::test]
    async fn test_groups_each_get_every_message() {
        let bus = InMemoryBus::new();
        let mut a = bus.subscribe("events", "group-a").await.unwrap();
        bus.publish("events", msg("1")).await.unwrap();
        let mut b = bus.subscribe("events", "group-b").await.unwrap();

        let first_a = a.next().await.unwrap().unwrap();
        let first_b = b.next().await.unwrap().unwrap();
        assert_eq!(first_a.message.payload, Bytes::from_static(b"1"));
        assert_eq!(first_a.message.uuid, first_b.message.uuid);
    }

    #[tokio::test]
    async fn test_nack_requeues() {
        let bus = InMemoryBus::new();
        let mut stream = bus.subscribe("events", "g").await.unwrap();
        bus.publish("events", msg("1")).await.unwrap();

        let delivery = stream.next().await.unwrap().unwrap();
        delivery.acker.nack().await.unwrap();
        let again = stream.next().await.unwrap().unwrap();
        assert_eq!(again.message.uuid, delivery.message.uuid);
        again.acker.ack().await.unwrap();

        assert_eq!(bus.nack_count(), 1);
        assert_eq!(bus.ack_count(), 1);
        assert_eq!(bus.published("events").len(), 1);
        assert!(bus.published("other").is_empty());
    }
}
