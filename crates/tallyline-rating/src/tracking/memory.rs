//! In-memory collaborators
//!
//! [`InMemoryStore`] holds the catalog (customers, subscriptions, prices,
//! meters, features, cost sheets) and the raw event log.
//! [`InMemoryUsageSink`] stores rated records unique by dedup key and answers
//! backfill scans and analytics queries over them. Used by tests and by the
//! worker's standalone mode.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;
use tallyline_common::{
    CostSheet, Customer, Event, Feature, Meter, Price, Result, Status, Subscription, TallyError, UsageRecord,
};
use tracing::{debug, info};

use super::repository::{
    CostSheetRepository, CustomerRepository, FeatureQuery, FeatureRepository, MaxBucketFeature, MeterQuery,
    MeterRepository, PriceQuery, PriceRepository, SubscriptionQuery, SubscriptionRepository, TenantScope,
    UnprocessedEventSource, UnprocessedQuery, UsageAnalyticsParams, UsageAnalyticsStore, UsageSink,
};
use crate::metering::{property_dimension, DetailedUsageAnalytic, UsageAccumulator, GROUP_SOURCE};

/// JSON catalog for one tenant environment.
///
/// Entities without a tenant (or environment) inherit the seed's.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogSeed {
    pub tenant_id: String,
    pub environment_id: String,
    pub customers: Vec<Customer>,
    pub subscriptions: Vec<Subscription>,
    pub prices: Vec<Price>,
    pub meters: Vec<Meter>,
    pub features: Vec<Feature>,
    pub cost_sheets: Vec<CostSheet>,
    pub events: Vec<Event>,
}

fn inherit(field: &mut String, value: &str) {
    if field.is_empty() {
        field.push_str(value);
    }
}

/// Catalog and raw event log
#[derive(Default)]
pub struct InMemoryStore {
    customers: DashMap<String, Customer>,
    subscriptions: DashMap<String, Subscription>,
    prices: DashMap<String, Price>,
    meters: DashMap<String, Meter>,
    features: DashMap<String, Feature>,
    cost_sheets: DashMap<String, CostSheet>,
    events: RwLock<Vec<Event>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: CatalogSeed) -> Self {
        let store = Self::new();
        store.load(seed);
        store
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| TallyError::Config(format!("read catalog {}: {}", path.display(), e)))?;
        let seed: CatalogSeed = serde_json::from_str(&raw)?;
        Ok(Self::from_seed(seed))
    }

    /// Add a seed's entities, stamping the seed's tenant on unscoped ones
    pub fn load(&self, seed: CatalogSeed) {
        let CatalogSeed {
            tenant_id,
            environment_id,
            customers,
            subscriptions,
            prices,
            meters,
            features,
            cost_sheets,
            events,
        } = seed;

        for mut c in customers {
            inherit(&mut c.tenant_id, &tenant_id);
            inherit(&mut c.environment_id, &environment_id);
            self.customers.insert(c.id.clone(), c);
        }
        for mut s in subscriptions {
            inherit(&mut s.tenant_id, &tenant_id);
            self.subscriptions.insert(s.id.clone(), s);
        }
        for mut p in prices {
            inherit(&mut p.tenant_id, &tenant_id);
            self.prices.insert(p.id.clone(), p);
        }
        for mut m in meters {
            inherit(&mut m.tenant_id, &tenant_id);
            self.meters.insert(m.id.clone(), m);
        }
        for f in features {
            self.features.insert(f.id.clone(), f);
        }
        for mut cs in cost_sheets {
            inherit(&mut cs.tenant_id, &tenant_id);
            inherit(&mut cs.environment_id, &environment_id);
            self.cost_sheets.insert(cs.id.clone(), cs);
        }
        for mut e in events {
            inherit(&mut e.tenant_id, &tenant_id);
            inherit(&mut e.environment_id, &environment_id);
            self.record_event(e);
        }

        info!(
            tenant_id = %tenant_id,
            customers = self.customers.len(),
            subscriptions = self.subscriptions.len(),
            prices = self.prices.len(),
            meters = self.meters.len(),
            "Loaded catalog"
        );
    }

    /// Append to the raw event log
    pub fn record_event(&self, event: Event) {
        self.events.write().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.read().clone()
    }

    /// Replace a price, e.g. after a tier change
    pub fn upsert_price(&self, price: Price) {
        self.prices.insert(price.id.clone(), price);
    }
}

#[async_trait]
impl CustomerRepository for InMemoryStore {
    async fn get_by_external_id(&self, scope: &TenantScope, external_id: &str) -> Result<Customer> {
        self.customers
            .iter()
            .find(|c| {
                c.tenant_id == scope.tenant_id
                    && c.environment_id == scope.environment_id
                    && c.external_id == external_id
            })
            .map(|c| c.value().clone())
            .ok_or_else(|| TallyError::not_found("customer", external_id))
    }
}

#[async_trait]
impl SubscriptionRepository for InMemoryStore {
    async fn list(&self, scope: &TenantScope, query: &SubscriptionQuery) -> Result<Vec<Subscription>> {
        let mut subs: Vec<Subscription> = self
            .subscriptions
            .iter()
            .filter(|s| {
                s.tenant_id == scope.tenant_id
                    && s.customer_id == query.customer_id
                    && (query.statuses.is_empty() || query.statuses.contains(&s.status))
            })
            .map(|s| {
                let mut sub = s.value().clone();
                if !query.with_line_items {
                    sub.line_items.clear();
                }
                sub
            })
            .collect();
        subs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(subs)
    }
}

#[async_trait]
impl PriceRepository for InMemoryStore {
    async fn list(&self, scope: &TenantScope, query: &PriceQuery) -> Result<Vec<Price>> {
        let mut prices: Vec<Price> = self
            .prices
            .iter()
            .filter(|p| p.tenant_id == scope.tenant_id && query.matches(p.value()))
            .map(|p| p.value().clone())
            .collect();
        prices.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(prices)
    }
}

#[async_trait]
impl MeterRepository for InMemoryStore {
    async fn list(&self, scope: &TenantScope, query: &MeterQuery) -> Result<Vec<Meter>> {
        let mut meters: Vec<Meter> = self
            .meters
            .iter()
            .filter(|m| {
                m.tenant_id == scope.tenant_id && query.ids.as_ref().map_or(true, |ids| ids.contains(&m.id))
            })
            .map(|m| m.value().clone())
            .collect();
        meters.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(meters)
    }
}

#[async_trait]
impl FeatureRepository for InMemoryStore {
    async fn list(&self, _scope: &TenantScope, query: &FeatureQuery) -> Result<Vec<Feature>> {
        let mut features: Vec<Feature> = self
            .features
            .iter()
            .filter(|f| query.matches(f.value()))
            .map(|f| f.value().clone())
            .collect();
        features.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(features)
    }
}

#[async_trait]
impl CostSheetRepository for InMemoryStore {
    async fn get_active(&self, scope: &TenantScope) -> Result<Option<CostSheet>> {
        let mut sheets: Vec<CostSheet> = self
            .cost_sheets
            .iter()
            .filter(|cs| {
                cs.tenant_id == scope.tenant_id
                    && cs.environment_id == scope.environment_id
                    && cs.status == Status::Published
            })
            .map(|cs| cs.value().clone())
            .collect();
        sheets.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(sheets.into_iter().next())
    }
}

/// Rated records unique by dedup key
pub struct InMemoryUsageSink<R: UsageRecord> {
    records: DashMap<String, R>,
    processed_events: DashMap<String, ()>,
    event_log: Option<Arc<InMemoryStore>>,
    _record: PhantomData<R>,
}

impl<R: UsageRecord> Default for InMemoryUsageSink<R> {
    fn default() -> Self {
        Self {
            records: DashMap::new(),
            processed_events: DashMap::new(),
            event_log: None,
            _record: PhantomData,
        }
    }
}

impl<R: UsageRecord> InMemoryUsageSink<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer backfill scans from `store`'s event log
    pub fn with_event_log(mut self, store: Arc<InMemoryStore>) -> Self {
        self.event_log = Some(store);
        self
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Stored records ordered by dedup key
    pub fn records(&self) -> Vec<R> {
        let mut records: Vec<(String, R)> = self
            .records
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        records.sort_by(|a, b| a.0.cmp(&b.0));
        records.into_iter().map(|(_, r)| r).collect()
    }

    pub fn is_processed(&self, event_id: &str) -> bool {
        self.processed_events.contains_key(event_id)
    }
}

#[async_trait]
impl<R: UsageRecord> UsageSink<R> for InMemoryUsageSink<R> {
    async fn bulk_insert(&self, records: Vec<R>) -> Result<()> {
        let mut inserted = 0usize;
        let total = records.len();
        for record in records {
            self.processed_events.insert(record.event().id.clone(), ());
            if let Entry::Vacant(slot) = self.records.entry(record.dedup_key()) {
                slot.insert(record);
                inserted += 1;
            }
        }
        debug!(total, inserted, duplicates = total - inserted, "Bulk insert");
        Ok(())
    }
}

#[async_trait]
impl<R: UsageRecord> UnprocessedEventSource for InMemoryUsageSink<R> {
    async fn find_unprocessed(&self, query: &UnprocessedQuery) -> Result<Vec<Event>> {
        let Some(store) = &self.event_log else {
            return Ok(Vec::new());
        };
        let mut events: Vec<Event> = store
            .events
            .read()
            .iter()
            .filter(|e| query.matches(e) && !self.is_processed(&e.id))
            .cloned()
            .collect();
        events.sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)));
        events.truncate(query.batch_size);
        Ok(events)
    }
}

/// Dimension values of one analytics row
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct RowKey {
    feature_id: String,
    source: String,
    properties: Vec<(String, String)>,
}

#[derive(Default)]
struct RowAcc {
    meter_id: String,
    total: UsageAccumulator,
    windows: BTreeMap<DateTime<Utc>, UsageAccumulator>,
}

fn row_key<R: UsageRecord>(record: &R, feature_id: &str, group_by: &[String]) -> RowKey {
    let event = record.event();
    let mut key = RowKey {
        feature_id: feature_id.to_string(),
        source: String::new(),
        properties: Vec::new(),
    };
    for dim in group_by {
        if dim == GROUP_SOURCE {
            key.source = event.source.clone();
        } else if let Some(name) = property_dimension(dim) {
            let value = event.property(name).map(|v| v.to_string()).unwrap_or_default();
            key.properties.push((name.to_string(), value));
        }
    }
    key
}

fn accepts<R: UsageRecord>(record: &R, params: &UsageAnalyticsParams) -> bool {
    let event = record.event();
    let Some(feature_id) = record.feature_id() else {
        return false;
    };
    event.tenant_id == params.scope.tenant_id
        && event.customer_id == params.customer_id
        && (params.feature_ids.is_empty() || params.feature_ids.iter().any(|f| f == feature_id))
        && (params.sources.is_empty() || params.sources.contains(&event.source))
        && params.start_time.map_or(true, |start| event.timestamp >= start)
        && params.end_time.map_or(true, |end| event.timestamp < end)
        && params.property_filters.iter().all(|(name, values)| {
            event
                .property(name)
                .map_or(false, |v| values.contains(&v.to_string()))
        })
}

#[async_trait]
impl<R: UsageRecord> UsageAnalyticsStore for InMemoryUsageSink<R> {
    async fn detailed_usage(
        &self,
        params: &UsageAnalyticsParams,
        max_bucket_features: &HashMap<String, MaxBucketFeature>,
    ) -> Result<Vec<DetailedUsageAnalytic>> {
        let mut rows: BTreeMap<RowKey, RowAcc> = BTreeMap::new();
        let mut features_seen = HashSet::new();

        for entry in self.records.iter() {
            let record = entry.value();
            if !accepts(record, params) {
                continue;
            }
            let feature_id = record.feature_id().unwrap_or_default();
            features_seen.insert(feature_id.to_string());

            let event = record.event();
            let row = rows.entry(row_key(record, feature_id, &params.group_by)).or_default();
            row.meter_id = record.meter_id().to_string();
            row.total
                .record(&event.id, record.unique_hash(), event.timestamp, record.qty_total());

            let window = match max_bucket_features.get(feature_id) {
                Some(bucketed) => Some(bucketed.bucket_size),
                None => params.window_size,
            };
            if let Some(window) = window {
                row.windows
                    .entry(window.truncate(event.timestamp))
                    .or_default()
                    .record(&event.id, record.unique_hash(), event.timestamp, record.qty_total());
            }
        }

        let items = rows
            .into_iter()
            .map(|(key, acc)| {
                let mut item = DetailedUsageAnalytic::new(key.feature_id.clone());
                item.meter_id = acc.meter_id;
                item.source = key.source;
                item.properties = key.properties.into_iter().collect();
                item.event_count = acc.total.event_count();
                item.count_unique_usage = acc.total.count_unique();
                item.latest_usage = acc.total.latest();
                item.points = acc
                    .windows
                    .iter()
                    .map(|(ts, window)| window.to_point(*ts))
                    .collect();

                if max_bucket_features.contains_key(&key.feature_id) {
                    item.total_usage = item.points.iter().map(|p| p.max_usage).sum();
                    item.max_usage = item.points.iter().map(|p| p.max_usage).max().unwrap_or_default();
                } else {
                    item.total_usage = acc.total.sum();
                    item.max_usage = acc.total.max();
                }
                item
            })
            .collect::<Vec<_>>();

        debug!(rows = items.len(), features = features_seen.len(), "Detailed usage");
        Ok(items)
    }
}
