//! Collaborator contracts
//!
//! Read-only catalog lookups, the usage sinks, the unprocessed-event source
//! used by backfill and the pre-aggregated analytics store. Every catalog
//! listing is batched by ID set.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tallyline_common::{
    CostSheet, Customer, Event, Feature, Meter, Price, PriceEntityType, Result, Status, Subscription,
    SubscriptionStatus, UsageRecord, WindowSize,
};

use crate::metering::DetailedUsageAnalytic;

/// Tenant and environment every lookup is scoped to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct TenantScope {
    pub tenant_id: String,
    pub environment_id: String,
}

impl TenantScope {
    pub fn new(tenant_id: impl Into<String>, environment_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            environment_id: environment_id.into(),
        }
    }

    pub fn of(event: &Event) -> Self {
        Self::new(event.tenant_id.clone(), event.environment_id.clone())
    }
}

#[async_trait]
pub trait CustomerRepository: Send + Sync {
    /// Customer by the key event producers use; `NotFound` when unknown
    async fn get_by_external_id(&self, scope: &TenantScope, external_id: &str) -> Result<Customer>;
}

#[derive(Debug, Clone, Default)]
pub struct SubscriptionQuery {
    pub customer_id: String,
    pub statuses: Vec<SubscriptionStatus>,
    pub with_line_items: bool,
}

impl SubscriptionQuery {
    /// Subscriptions that accrue usage, with their line items
    pub fn billable(customer_id: impl Into<String>) -> Self {
        Self {
            customer_id: customer_id.into(),
            statuses: SubscriptionStatus::BILLABLE.to_vec(),
            with_line_items: true,
        }
    }
}

#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    async fn list(&self, scope: &TenantScope, query: &SubscriptionQuery) -> Result<Vec<Subscription>>;
}

#[derive(Debug, Clone, Default)]
pub struct PriceQuery {
    pub price_ids: Option<Vec<String>>,
    pub meter_ids: Option<Vec<String>>,
    pub entity: Option<(PriceEntityType, String)>,
    pub status: Option<Status>,
}

impl PriceQuery {
    pub fn by_ids(price_ids: Vec<String>) -> Self {
        Self {
            price_ids: Some(price_ids),
            status: Some(Status::Published),
            ..Default::default()
        }
    }

    pub fn by_entity(entity_type: PriceEntityType, entity_id: impl Into<String>) -> Self {
        Self {
            entity: Some((entity_type, entity_id.into())),
            status: Some(Status::Published),
            ..Default::default()
        }
    }

    pub fn by_meters(meter_ids: Vec<String>) -> Self {
        Self {
            meter_ids: Some(meter_ids),
            status: Some(Status::Published),
            ..Default::default()
        }
    }

    pub fn matches(&self, price: &Price) -> bool {
        if let Some(ids) = &self.price_ids {
            if !ids.contains(&price.id) {
                return false;
            }
        }
        if let Some(ids) = &self.meter_ids {
            if !price.meter_id.as_ref().map_or(false, |m| ids.contains(m)) {
                return false;
            }
        }
        if let Some((entity_type, entity_id)) = &self.entity {
            if price.entity_type != *entity_type || &price.entity_id != entity_id {
                return false;
            }
        }
        self.status.map_or(true, |status| price.status == status)
    }
}

#[async_trait]
pub trait PriceRepository: Send + Sync {
    async fn list(&self, scope: &TenantScope, query: &PriceQuery) -> Result<Vec<Price>>;
}

#[derive(Debug, Clone, Default)]
pub struct MeterQuery {
    /// `None` lists every meter of the tenant
    pub ids: Option<Vec<String>>,
}

#[async_trait]
pub trait MeterRepository: Send + Sync {
    async fn list(&self, scope: &TenantScope, query: &MeterQuery) -> Result<Vec<Meter>>;
}

#[derive(Debug, Clone, Default)]
pub struct FeatureQuery {
    pub ids: Option<Vec<String>>,
    pub meter_ids: Option<Vec<String>>,
}

impl FeatureQuery {
    pub fn matches(&self, feature: &Feature) -> bool {
        self.ids.as_ref().map_or(true, |ids| ids.contains(&feature.id))
            && self
                .meter_ids
                .as_ref()
                .map_or(true, |ids| ids.contains(&feature.meter_id))
    }
}

#[async_trait]
pub trait FeatureRepository: Send + Sync {
    async fn list(&self, scope: &TenantScope, query: &FeatureQuery) -> Result<Vec<Feature>>;
}

#[async_trait]
pub trait CostSheetRepository: Send + Sync {
    /// The published cost sheet of the tenant environment, if any
    async fn get_active(&self, scope: &TenantScope) -> Result<Option<CostSheet>>;
}

/// Persists rated records.
///
/// Must accept records whose dedup key was already stored; the key is the
/// uniqueness constraint.
#[async_trait]
pub trait UsageSink<R: UsageRecord>: Send + Sync {
    async fn bulk_insert(&self, records: Vec<R>) -> Result<()>;
}

/// Keyset position of a backfill scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventCursor {
    pub id: String,
    pub timestamp: DateTime<Utc>,
}

impl EventCursor {
    pub fn after(event: &Event) -> Self {
        Self {
            id: event.id.clone(),
            timestamp: event.timestamp,
        }
    }

    /// Whether `event` sorts strictly after this cursor in (timestamp, id) order
    pub fn precedes(&self, event: &Event) -> bool {
        (event.timestamp, event.id.as_str()) > (self.timestamp, self.id.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct UnprocessedQuery {
    pub scope: TenantScope,
    pub external_customer_id: Option<String>,
    pub event_name: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub batch_size: usize,
    pub cursor: Option<EventCursor>,
}

impl UnprocessedQuery {
    pub fn matches(&self, event: &Event) -> bool {
        event.tenant_id == self.scope.tenant_id
            && event.environment_id == self.scope.environment_id
            && event.timestamp >= self.start
            && event.timestamp < self.end
            && self
                .external_customer_id
                .as_ref()
                .map_or(true, |c| &event.external_customer_id == c)
            && self.event_name.as_ref().map_or(true, |n| &event.event_name == n)
            && self.cursor.as_ref().map_or(true, |c| c.precedes(event))
    }
}

/// Events ingested but never rated, ordered by (timestamp, id)
#[async_trait]
pub trait UnprocessedEventSource: Send + Sync {
    async fn find_unprocessed(&self, query: &UnprocessedQuery) -> Result<Vec<Event>>;
}

/// Bucket size of a MAX meter billed per bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaxBucketFeature {
    pub feature_id: String,
    pub meter_id: String,
    pub bucket_size: WindowSize,
}

/// Filters of one analytics query, resolved to internal IDs
#[derive(Debug, Clone, Default)]
pub struct UsageAnalyticsParams {
    pub scope: TenantScope,
    pub customer_id: String,
    pub external_customer_id: String,
    pub feature_ids: Vec<String>,
    pub sources: Vec<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub group_by: Vec<String>,
    pub window_size: Option<WindowSize>,
    /// Property name to accepted values
    pub property_filters: HashMap<String, Vec<String>>,
}

/// Pre-aggregated usage-fact store
#[async_trait]
pub trait UsageAnalyticsStore: Send + Sync {
    /// One row per feature and requested dimension values.
    ///
    /// Rows for features in `max_bucket_features` carry one point per bucket
    /// holding that bucket's max, and their `total_usage` is the sum of bucket
    /// maxima.
    async fn detailed_usage(
        &self,
        params: &UsageAnalyticsParams,
        max_bucket_features: &HashMap<String, MaxBucketFeature>,
    ) -> Result<Vec<DetailedUsageAnalytic>>;
}
