//! Event fan-out pipeline
//!
//! One pipeline type serves both subscription usage and cost-sheet usage;
//! the [`TargetResolver`] decides what an event is billed against. Per event
//! the steps run sequentially:
//!
//! 1. resolve the external customer key (unknown customer is a no-op)
//! 2. resolve billing targets
//! 3. match, extract and hash per target
//! 4. hand all records to the sink in one bulk insert

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tallyline_common::{Event, Result, TallyError};
use tracing::{debug, error, info, instrument, warn};

use super::metrics::PipelineMetrics;
use super::repository::{CustomerRepository, TenantScope, UsageSink};
use super::resolver::{RatedMatch, TargetResolver};
use crate::metering::{extract, match_prices, unique_hash};
use crate::transport::{
    HandlerConfig, Message, MessageHandler, Publisher, Router, META_ENVIRONMENT_ID, META_PARTITION_KEY,
    META_TENANT_ID,
};

/// Topics, consumer group and throttles of one pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaneSettings {
    pub topic: String,
    pub topic_lazy: String,
    pub topic_backfill: String,
    pub consumer_group: String,
    /// Messages per second, 0 disables throttling
    pub rate_limit: u32,
    pub rate_limit_lazy: u32,
    pub rate_limit_backfill: u32,
}

impl LaneSettings {
    /// Lanes named after `base`: `base`, `base.lazy`, `base.backfill`
    pub fn named(base: &str) -> Self {
        Self {
            topic: base.to_string(),
            topic_lazy: format!("{}.lazy", base),
            topic_backfill: format!("{}.backfill", base),
            consumer_group: base.replace('.', "-"),
            ..Default::default()
        }
    }
}

impl Default for LaneSettings {
    fn default() -> Self {
        Self {
            topic: String::new(),
            topic_lazy: String::new(),
            topic_backfill: String::new(),
            consumer_group: String::new(),
            rate_limit: 100,
            rate_limit_lazy: 10,
            rate_limit_backfill: 10,
        }
    }
}

/// Publishes events for (re)processing
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Put `event` on the primary lane, or the backfill lane
    async fn publish_event(&self, event: &Event, backfill: bool) -> Result<()>;
}

/// Rates events into usage records of `T::Record`
pub struct TrackingPipeline<T: TargetResolver> {
    resolver: T,
    customers: Arc<dyn CustomerRepository>,
    sink: Arc<dyn UsageSink<T::Record>>,
    publisher: Arc<dyn Publisher>,
    backfill_publisher: Option<Arc<dyn Publisher>>,
    lanes: LaneSettings,
    metrics: PipelineMetrics,
}

impl<T: TargetResolver> TrackingPipeline<T> {
    pub fn new(
        resolver: T,
        customers: Arc<dyn CustomerRepository>,
        sink: Arc<dyn UsageSink<T::Record>>,
        publisher: Arc<dyn Publisher>,
        lanes: LaneSettings,
    ) -> Result<Self> {
        let metrics = PipelineMetrics::new(resolver.name())?;
        Ok(Self {
            resolver,
            customers,
            sink,
            publisher,
            backfill_publisher: None,
            lanes,
            metrics,
        })
    }

    pub fn with_backfill_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.backfill_publisher = Some(publisher);
        self
    }

    pub fn name(&self) -> &'static str {
        self.resolver.name()
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    pub fn lanes(&self) -> &LaneSettings {
        &self.lanes
    }

    /// Usage records `event` produces, without persisting them
    #[instrument(skip_all, fields(pipeline = self.name(), event_id = %event.id, event_name = %event.event_name))]
    pub async fn rate_event(&self, mut event: Event) -> Result<Vec<T::Record>> {
        let scope = TenantScope::of(&event);
        let customer = match self
            .customers
            .get_by_external_id(&scope, &event.external_customer_id)
            .await
        {
            Ok(customer) => customer,
            Err(e) if e.is_not_found() => {
                debug!(external_customer_id = %event.external_customer_id, "Customer not found, skipping event");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        event.customer_id = customer.id.clone();

        let resolved = self.resolver.resolve_targets(&scope, &customer, &event).await?;
        if resolved.is_empty() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for target in &resolved.targets {
            for matched in match_prices(&event, &target.prices, &resolved.catalog.meters) {
                let feature = resolved.catalog.features_by_meter.get(&matched.meter.id);
                if feature.is_none() {
                    warn!(
                        target_id = %target.id,
                        meter_id = %matched.meter.id,
                        "Feature not found for meter, billing without feature"
                    );
                }

                let extracted = match extract(&event, matched.meter, target.period.as_ref()) {
                    Ok(extracted) => extracted,
                    Err(e) => {
                        warn!(
                            target_id = %target.id,
                            price_id = %matched.price.id,
                            meter_id = %matched.meter.id,
                            error = %e,
                            "Failed to extract quantity, skipping match"
                        );
                        continue;
                    }
                };

                let rated = RatedMatch {
                    price: matched.price,
                    meter: matched.meter,
                    feature,
                    unique_hash: unique_hash(&event, matched.meter),
                    quantity: extracted.quantity,
                };
                records.push(self.resolver.build_record(&event, target, rated));
            }
        }

        debug!(targets = resolved.targets.len(), records = records.len(), "Rated event");
        Ok(records)
    }

    /// Rate `event` and persist its records, returning how many were emitted
    pub async fn process_event(&self, event: Event) -> Result<usize> {
        let records = self.rate_event(event).await?;
        let emitted = records.len();
        if emitted > 0 {
            self.sink.bulk_insert(records).await?;
            self.metrics.records_emitted.inc_by(emitted as u64);
        }
        Ok(emitted)
    }

    fn encode(event: &Event) -> Result<Message> {
        let payload = serde_json::to_vec(event)?;
        Ok(Message::new(payload)
            .with_metadata(META_TENANT_ID, event.tenant_id.clone())
            .with_metadata(META_ENVIRONMENT_ID, event.environment_id.clone())
            .with_metadata(META_PARTITION_KEY, event.partition_key()))
    }

    fn drop_message(&self, message: &Message, reason: &str) {
        error!(pipeline = self.name(), message_uuid = %message.uuid, reason, "Dropping message");
        self.metrics.events_dropped.inc();
    }
}

impl<T: TargetResolver> TrackingPipeline<T> {
    /// Register the primary lane and, when configured, the backfill lane
    pub fn register_handlers(self: &Arc<Self>, router: &mut Router) -> Result<()> {
        router.add_handler(
            HandlerConfig::new(
                format!("{}_handler", self.name()),
                self.lanes.topic.clone(),
                self.lanes.consumer_group.clone(),
                self.lanes.rate_limit,
            ),
            self.clone(),
        )?;

        if self.lanes.topic_backfill.is_empty() {
            warn!(pipeline = self.name(), "Backfill topic not configured, skipping backfill handler");
            return Ok(());
        }
        router.add_handler(
            HandlerConfig::new(
                format!("{}_backfill_handler", self.name()),
                self.lanes.topic_backfill.clone(),
                format!("{}-backfill", self.lanes.consumer_group),
                self.lanes.rate_limit_backfill,
            ),
            self.clone(),
        )
    }

    /// Register the lazy lane
    pub fn register_lazy_handler(self: &Arc<Self>, router: &mut Router) -> Result<()> {
        if self.lanes.topic_lazy.is_empty() {
            warn!(pipeline = self.name(), "Lazy topic not configured, skipping lazy handler");
            return Ok(());
        }
        router.add_handler(
            HandlerConfig::new(
                format!("{}_lazy_handler", self.name()),
                self.lanes.topic_lazy.clone(),
                format!("{}-lazy", self.lanes.consumer_group),
                self.lanes.rate_limit_lazy,
            ),
            self.clone(),
        )
    }
}

#[async_trait]
impl<T: TargetResolver> EventPublisher for TrackingPipeline<T> {
    async fn publish_event(&self, event: &Event, backfill: bool) -> Result<()> {
        let message = Self::encode(event)?;
        let uuid = message.uuid.clone();

        if backfill {
            let Some(publisher) = &self.backfill_publisher else {
                return Err(TallyError::Transport(format!(
                    "{}: backfill publisher not configured",
                    self.name()
                )));
            };
            if self.lanes.topic_backfill.is_empty() {
                return Err(TallyError::Config(format!("{}: backfill topic not configured", self.name())));
            }
            publisher.publish(&self.lanes.topic_backfill, message).await?;
        } else {
            self.publisher.publish(&self.lanes.topic, message).await?;
        }

        debug!(
            pipeline = self.name(),
            event_id = %event.id,
            message_uuid = %uuid,
            backfill,
            "Published event"
        );
        Ok(())
    }
}

#[async_trait]
impl<T: TargetResolver> MessageHandler for TrackingPipeline<T> {
    async fn handle(&self, message: &Message) -> Result<()> {
        let event: Event = match serde_json::from_slice(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                self.drop_message(message, &format!("unparsable event: {}", e));
                return Ok(());
            }
        };

        let tenant_id = message.metadata(META_TENANT_ID).unwrap_or_default();
        if event.tenant_id != tenant_id {
            self.drop_message(message, "event tenant does not match message tenant");
            return Ok(());
        }

        let event_id = event.id.clone();
        match self.process_event(event).await {
            Ok(emitted) => {
                self.metrics.events_processed.inc();
                if emitted > 0 {
                    info!(pipeline = self.name(), event_id = %event_id, records = emitted, "Tracked usage");
                }
                Ok(())
            }
            Err(e) => {
                self.metrics.events_failed.inc();
                error!(pipeline = self.name(), event_id = %event_id, error = %e, "Failed to process event");
                Err(e)
            }
        }
    }
}
