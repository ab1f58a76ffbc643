//! Backfill reprocessing
//!
//! Pages through events that were ingested but never rated, using a keyset
//! cursor on (timestamp, id), and republishes each one on the backfill lane.
//! Rating is idempotent on the dedup hash, so a range can be re-run safely.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tallyline_common::{Result, TallyError};
use tracing::{debug, info, instrument, warn};

use super::pipeline::EventPublisher;
use super::repository::{EventCursor, TenantScope, UnprocessedEventSource, UnprocessedQuery};

pub const DEFAULT_BATCH_SIZE: usize = 100;

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReprocessParams {
    #[serde(default)]
    pub external_customer_id: Option<String>,
    #[serde(default)]
    pub event_name: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl ReprocessParams {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            external_customer_id: None,
            event_name: None,
            start,
            end,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReprocessSummary {
    pub batches: usize,
    pub found: usize,
    pub published: usize,
}

/// Republishes unprocessed events onto a pipeline's backfill lane
pub struct Reprocessor {
    source: Arc<dyn UnprocessedEventSource>,
    publisher: Arc<dyn EventPublisher>,
}

impl Reprocessor {
    pub fn new(source: Arc<dyn UnprocessedEventSource>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { source, publisher }
    }

    #[instrument(skip(self, params), fields(tenant_id = %scope.tenant_id))]
    pub async fn reprocess(&self, scope: &TenantScope, params: &ReprocessParams) -> Result<ReprocessSummary> {
        if params.end <= params.start {
            return Err(TallyError::Validation("end must be after start".into()));
        }
        let batch_size = if params.batch_size == 0 {
            DEFAULT_BATCH_SIZE
        } else {
            params.batch_size
        };

        let mut summary = ReprocessSummary::default();
        let mut cursor = None;

        loop {
            let query = UnprocessedQuery {
                scope: scope.clone(),
                external_customer_id: params.external_customer_id.clone(),
                event_name: params.event_name.clone(),
                start: params.start,
                end: params.end,
                batch_size,
                cursor: cursor.clone(),
            };
            let events = self.source.find_unprocessed(&query).await?;
            summary.batches += 1;
            summary.found += events.len();

            for event in &events {
                match self.publisher.publish_event(event, true).await {
                    Ok(()) => summary.published += 1,
                    Err(e) => warn!(event_id = %event.id, error = %e, "Failed to republish event, skipping"),
                }
            }
            debug!(batch = summary.batches, events = events.len(), "Reprocessed batch");

            match events.last() {
                Some(last) if events.len() >= batch_size => cursor = Some(EventCursor::after(last)),
                _ => break,
            }
        }

        info!(
            batches = summary.batches,
            found = summary.found,
            published = summary.published,
            "Reprocessing finished"
        );
        Ok(summary)
    }
}
