//! Handler router
//!
//! Runs one consumer lane per registered handler. Each lane owns its consumer
//! group and its token-bucket limiter, so a saturated lane never slows the
//! others down.

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tallyline_common::{Result, TallyError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{Delivery, MessageHandler, MessageStream, Subscriber};

type LaneLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

/// Pause after a broken delivery before pulling again
const STREAM_ERROR_BACKOFF: Duration = Duration::from_millis(250);

/// One consumer lane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerConfig {
    /// Unique handler name
    pub name: String,
    pub topic: String,
    pub consumer_group: String,
    /// Messages per second, 0 disables throttling
    pub rate_limit: u32,
}

impl HandlerConfig {
    pub fn new(
        name: impl Into<String>,
        topic: impl Into<String>,
        consumer_group: impl Into<String>,
        rate_limit: u32,
    ) -> Self {
        Self {
            name: name.into(),
            topic: topic.into(),
            consumer_group: consumer_group.into(),
            rate_limit,
        }
    }

    fn limiter(&self) -> Option<LaneLimiter> {
        NonZeroU32::new(self.rate_limit).map(|rate| Arc::new(RateLimiter::direct(Quota::per_second(rate))))
    }
}

struct Lane {
    config: HandlerConfig,
    handler: Arc<dyn MessageHandler>,
}

/// Registry of consumer lanes over one subscriber
pub struct Router {
    subscriber: Arc<dyn Subscriber>,
    lanes: Vec<Lane>,
}

impl Router {
    pub fn new(subscriber: Arc<dyn Subscriber>) -> Self {
        Self {
            subscriber,
            lanes: Vec::new(),
        }
    }

    /// Register a handler lane.
    ///
    /// Handler names are unique; a duplicate name is a configuration error.
    pub fn add_handler(&mut self, config: HandlerConfig, handler: Arc<dyn MessageHandler>) -> Result<()> {
        if config.topic.is_empty() {
            return Err(TallyError::Config(format!("handler {} has no topic", config.name)));
        }
        if self.lanes.iter().any(|lane| lane.config.name == config.name) {
            return Err(TallyError::Config(format!("handler {} registered twice", config.name)));
        }
        info!(
            handler = %config.name,
            topic = %config.topic,
            consumer_group = %config.consumer_group,
            rate_limit = config.rate_limit,
            "Registered handler"
        );
        self.lanes.push(Lane { config, handler });
        Ok(())
    }

    pub fn handlers(&self) -> impl Iterator<Item = &HandlerConfig> {
        self.lanes.iter().map(|lane| &lane.config)
    }

    pub fn len(&self) -> usize {
        self.lanes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }

    /// Subscribe every lane and spawn its consumer task
    pub async fn run(self) -> Result<RouterHandle> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(self.lanes.len());

        for lane in self.lanes {
            let stream = self
                .subscriber
                .subscribe(&lane.config.topic, &lane.config.consumer_group)
                .await?;
            let limiter = lane.config.limiter();
            let shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(consume(lane.config, lane.handler, stream, limiter, shutdown)));
        }

        info!(lanes = tasks.len(), "Router started");
        Ok(RouterHandle {
            shutdown: shutdown_tx,
            tasks,
        })
    }
}

/// Running router
pub struct RouterHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RouterHandle {
    /// Stop every lane and wait for in-flight messages to settle
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Consumer lane panicked");
            }
        }
        info!("Router stopped");
    }
}

async fn consume(
    config: HandlerConfig,
    handler: Arc<dyn MessageHandler>,
    mut stream: Box<dyn MessageStream>,
    limiter: Option<LaneLimiter>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown.changed() => break,
            next = stream.next() => next,
        };

        match next {
            None => {
                info!(handler = %config.name, "Message stream closed");
                break;
            }
            Some(Err(e)) => {
                error!(handler = %config.name, error = %e, "Failed to pull message");
                tokio::time::sleep(STREAM_ERROR_BACKOFF).await;
            }
            Some(Ok(delivery)) => {
                if let Some(limiter) = &limiter {
                    limiter.until_ready().await;
                }
                dispatch(&config, handler.as_ref(), delivery).await;
            }
        }
    }
}

async fn dispatch(config: &HandlerConfig, handler: &dyn MessageHandler, delivery: Delivery) {
    let Delivery { message, acker } = delivery;
    match handler.handle(&message).await {
        Ok(()) => {
            debug!(handler = %config.name, message_uuid = %message.uuid, "Message handled");
            if let Err(e) = acker.ack().await {
                error!(handler = %config.name, message_uuid = %message.uuid, error = %e, "Failed to ack message");
            }
        }
        Err(e) => {
            warn!(
                handler = %config.name,
                message_uuid = %message.uuid,
                error = %e,
                "Handler failed, message will be redelivered"
            );
            if let Err(e) = acker.nack().await {
                error!(handler = %config.name, message_uuid = %message.uuid, error = %e, "Failed to nack message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{InMemoryBus, Message, Publisher};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct FlakyHandler {
        calls: AtomicUsize,
        fail_first: usize,
        done: Notify,
        expected: usize,
    }

    #[async_trait]
    impl MessageHandler for FlakyHandler {
        async fn handle(&self, _message: &Message) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.expected {
                self.done.notify_one();
            }
            if n <= self.fail_first {
                return Err(TallyError::Database("unavailable".into()));
            }
            Ok(())
        }
    }

    #[test]
    fn test_zero_rate_disables_limiter() {
        assert!(HandlerConfig::new("h", "t", "g", 0).limiter().is_none());
        assert!(HandlerConfig::new("h", "t", "g", 10).limiter().is_some());
    }

    #[test]
    fn test_duplicate_handler_rejected() {
        let bus = Arc::new(InMemoryBus::new());
        let mut router = Router::new(bus);
        let handler = Arc::new(FlakyHandler {
            calls: AtomicUsize::new(0),
            fail_first: 0,
            done: Notify::new(),
            expected: 1,
        });
        router.add_handler(HandlerConfig::new("h", "events", "g", 0), handler.clone()).unwrap();
        assert!(router.add_handler(HandlerConfig::new("h", "events", "g", 0), handler.clone()).is_err());
        assert!(router.add_handler(HandlerConfig::new("h2", "", "g", 0), handler).is_err());
        assert_eq!(router.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_message_is_redelivered() {
        let bus = Arc::new(InMemoryBus::new());
        let handler = Arc::new(FlakyHandler {
            calls: AtomicUsize::new(0),
            fail_first: 1,
            done: Notify::new(),
            expected: 2,
        });

        let mut router = Router::new(bus.clone());
        router
            .add_handler(HandlerConfig::new("h", "events", "g", 100), handler.clone())
            .unwrap();
        let running = router.run().await.unwrap();

        bus.publish("events", Message::new(Bytes::from_static(b"{}"))).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), handler.done.notified())
            .await
            .unwrap();
        running.shutdown().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(bus.nack_count(), 1);
        assert_eq!(bus.ack_count(), 1);
    }
}
