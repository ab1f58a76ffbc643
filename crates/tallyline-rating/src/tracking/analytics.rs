//! Detailed usage analytics
//!
//! Answers "how much did this customer use, and what did it cost" over a
//! time window. Usage comes pre-aggregated from the analytics store; this
//! service resolves the customer and currency, discovers bucketed-max
//! features, prices every row and point, and merges rows for the requested
//! grouping.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tallyline_common::{
    AggregationType, Feature, Meter, Price, PricingError, Result, Subscription, TallyError, WindowSize,
};
use tracing::{debug, instrument, warn};

use super::repository::{
    CustomerRepository, FeatureQuery, MaxBucketFeature, MeterQuery, PriceQuery, SubscriptionQuery,
    SubscriptionRepository, TenantScope, UsageAnalyticsParams, UsageAnalyticsStore,
};
use super::resolver::CatalogLookups;
use crate::metering::{aggregate_by_grouping, DetailedUsageAnalytic};
use crate::pricing::PricingEngine;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageAnalyticsRequest {
    pub external_customer_id: String,
    pub feature_ids: Vec<String>,
    pub sources: Vec<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// `feature_id`, `source` or `properties.<name>`
    pub group_by: Vec<String>,
    pub window_size: Option<String>,
    pub property_filters: HashMap<String, Vec<String>>,
}

impl UsageAnalyticsRequest {
    pub fn for_customer(external_customer_id: impl Into<String>) -> Self {
        Self {
            external_customer_id: external_customer_id.into(),
            ..Default::default()
        }
    }

    /// Check required fields and parse the window size
    pub fn validate(&self) -> Result<Option<WindowSize>> {
        if self.external_customer_id.trim().is_empty() {
            return Err(TallyError::Validation("external_customer_id is required".into()));
        }
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            if end < start {
                return Err(TallyError::Validation("end_time must not be before start_time".into()));
            }
        }
        self.window_size
            .as_deref()
            .filter(|w| !w.is_empty())
            .map(|w| w.parse::<WindowSize>().map_err(TallyError::Validation))
            .transpose()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageAnalyticPointItem {
    pub timestamp: DateTime<Utc>,
    pub usage: Decimal,
    pub cost: Decimal,
    pub event_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageAnalyticItem {
    pub feature_id: String,
    pub feature_name: String,
    pub event_name: String,
    pub source: String,
    pub unit: String,
    pub unit_plural: String,
    pub aggregation_type: Option<AggregationType>,
    pub total_usage: Decimal,
    pub total_cost: Decimal,
    pub currency: String,
    pub event_count: u64,
    pub properties: BTreeMap<String, String>,
    pub points: Vec<UsageAnalyticPointItem>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UsageAnalyticsResponse {
    pub items: Vec<UsageAnalyticItem>,
    pub total_cost: Decimal,
    pub currency: String,
}

/// Catalog used to label and price analytics rows
#[derive(Debug, Default)]
struct Enrichment {
    features: HashMap<String, Feature>,
    meters: HashMap<String, Meter>,
    prices_by_meter: HashMap<String, Price>,
}

pub struct UsageAnalyticsService {
    customers: Arc<dyn CustomerRepository>,
    subscriptions: Arc<dyn SubscriptionRepository>,
    catalog: CatalogLookups,
    store: Arc<dyn UsageAnalyticsStore>,
    engine: PricingEngine,
}

impl UsageAnalyticsService {
    pub fn new(
        customers: Arc<dyn CustomerRepository>,
        subscriptions: Arc<dyn SubscriptionRepository>,
        catalog: CatalogLookups,
        store: Arc<dyn UsageAnalyticsStore>,
        engine: PricingEngine,
    ) -> Self {
        Self {
            customers,
            subscriptions,
            catalog,
            store,
            engine,
        }
    }

    #[instrument(skip(self, request), fields(tenant_id = %scope.tenant_id, external_customer_id = %request.external_customer_id))]
    pub async fn get_detailed_usage_analytics(
        &self,
        scope: &TenantScope,
        request: &UsageAnalyticsRequest,
    ) -> Result<UsageAnalyticsResponse> {
        let window_size = request.validate()?;

        let customer = self
            .customers
            .get_by_external_id(scope, &request.external_customer_id)
            .await?;
        let subscriptions = self
            .subscriptions
            .list(scope, &SubscriptionQuery::billable(customer.id.clone()))
            .await?;
        let currency = single_currency(&customer.id, &subscriptions)?;

        let (features, meters) = self.features_and_meters(scope, &request.feature_ids).await?;
        let max_bucket_features = max_bucket_features(&features, &meters);

        let params = UsageAnalyticsParams {
            scope: scope.clone(),
            customer_id: customer.id.clone(),
            external_customer_id: request.external_customer_id.clone(),
            feature_ids: request.feature_ids.clone(),
            sources: request.sources.clone(),
            start_time: request.start_time,
            end_time: request.end_time,
            group_by: request.group_by.clone(),
            window_size,
            property_filters: request.property_filters.clone(),
        };
        let mut items = self.store.detailed_usage(&params, &max_bucket_features).await?;
        if items.is_empty() {
            debug!("No usage in window");
            return Ok(UsageAnalyticsResponse {
                currency,
                ..Default::default()
            });
        }

        let prices_by_meter = match self.usage_prices(scope, &subscriptions).await {
            Ok(prices) => prices,
            Err(e) => {
                warn!(error = %e, "Failed to load prices, reporting usage without cost");
                HashMap::new()
            }
        };
        let enrichment = Enrichment {
            features: features.into_iter().map(|f| (f.id.clone(), f)).collect(),
            meters,
            prices_by_meter,
        };

        for item in &mut items {
            self.enrich(item, &enrichment);
            item.currency = currency.clone();
        }

        let merged = aggregate_by_grouping(items, &request.group_by);
        Ok(build_response(merged, &enrichment, window_size.is_some(), currency))
    }

    /// Requested features (all when none requested) and their meters
    async fn features_and_meters(
        &self,
        scope: &TenantScope,
        feature_ids: &[String],
    ) -> Result<(Vec<Feature>, HashMap<String, Meter>)> {
        let query = FeatureQuery {
            ids: (!feature_ids.is_empty()).then(|| feature_ids.to_vec()),
            meter_ids: None,
        };
        let features = self.catalog.features.list(scope, &query).await?;
        let meter_ids: Vec<String> = features
            .iter()
            .map(|f| f.meter_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if meter_ids.is_empty() {
            return Ok((features, HashMap::new()));
        }
        let meters = self
            .catalog
            .meters
            .list(scope, &MeterQuery { ids: Some(meter_ids) })
            .await?;
        Ok((features, meters.into_iter().map(|m| (m.id.clone(), m)).collect()))
    }

    /// Published usage prices of the subscriptions, keyed by meter
    async fn usage_prices(
        &self,
        scope: &TenantScope,
        subscriptions: &[Subscription],
    ) -> Result<HashMap<String, Price>> {
        let price_ids: Vec<String> = subscriptions
            .iter()
            .flat_map(|s| s.line_items.iter())
            .filter(|item| item.is_usage())
            .map(|item| item.price_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if price_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut by_meter = HashMap::new();
        for price in self.catalog.prices.list(scope, &PriceQuery::by_ids(price_ids)).await? {
            if let Some(meter_id) = price.meter_id.clone() {
                by_meter.entry(meter_id).or_insert(price);
            }
        }
        Ok(by_meter)
    }

    /// Label the row and price it and its points
    fn enrich(&self, item: &mut DetailedUsageAnalytic, enrichment: &Enrichment) {
        if let Some(feature) = enrichment.features.get(&item.feature_id) {
            item.feature_name = feature.name.clone();
            item.unit = feature.unit_singular.clone();
            item.unit_plural = feature.unit_plural.clone();
            if item.meter_id.is_empty() {
                item.meter_id = feature.meter_id.clone();
            }
        }
        let Some(meter) = enrichment.meters.get(&item.meter_id) else {
            debug!(feature_id = %item.feature_id, meter_id = %item.meter_id, "Meter not found for usage row");
            return;
        };
        item.event_name = meter.event_name.clone();
        item.aggregation_type = Some(meter.aggregation.kind);

        let Some(price) = enrichment.prices_by_meter.get(&meter.id) else {
            debug!(meter_id = %meter.id, "No price for meter, usage reported without cost");
            return;
        };

        if meter.is_bucketed_max() {
            let mut buckets: Vec<Decimal> = item.points.iter().map(|p| p.max_usage).collect();
            if buckets.is_empty() && item.max_usage > Decimal::ZERO {
                buckets.push(item.max_usage);
            }
            item.total_cost = self.engine.bucketed_cost(price, &buckets);
            for point in &mut item.points {
                point.cost = self.engine.cost(price, point.max_usage);
            }
        } else {
            let aggregation = item.aggregation_type;
            item.total_cost = self.engine.cost(price, item.usage_for(aggregation));
            for point in &mut item.points {
                point.cost = self.engine.cost(price, point.usage_for(aggregation));
            }
        }
    }
}

/// The one currency of the customer's subscriptions; empty with none
fn single_currency(customer_id: &str, subscriptions: &[Subscription]) -> Result<String> {
    let currencies: BTreeSet<String> = subscriptions.iter().map(|s| s.currency.to_lowercase()).collect();
    if currencies.len() > 1 {
        return Err(PricingError::MixedCurrencies {
            customer_id: customer_id.to_string(),
        }
        .into());
    }
    Ok(currencies.into_iter().next().unwrap_or_default())
}

fn max_bucket_features(features: &[Feature], meters: &HashMap<String, Meter>) -> HashMap<String, MaxBucketFeature> {
    features
        .iter()
        .filter_map(|feature| {
            let meter = meters.get(&feature.meter_id)?;
            let bucket_size = meter.aggregation.bucket_size.filter(|_| meter.is_bucketed_max())?;
            Some((
                feature.id.clone(),
                MaxBucketFeature {
                    feature_id: feature.id.clone(),
                    meter_id: meter.id.clone(),
                    bucket_size,
                },
            ))
        })
        .collect()
}

fn build_response(
    items: Vec<DetailedUsageAnalytic>,
    enrichment: &Enrichment,
    with_points: bool,
    currency: String,
) -> UsageAnalyticsResponse {
    let mut out: Vec<UsageAnalyticItem> = items
        .into_iter()
        .map(|item| {
            let aggregation = item.aggregation_type;
            let bucketed = enrichment
                .meters
                .get(&item.meter_id)
                .map_or(false, Meter::is_bucketed_max);
            let total_usage = if bucketed && !item.total_usage.is_zero() {
                item.total_usage
            } else {
                item.usage_for(aggregation)
            };
            let points = if with_points {
                item.points
                    .iter()
                    .map(|p| UsageAnalyticPointItem {
                        timestamp: p.timestamp,
                        usage: p.usage_for(aggregation),
                        cost: p.cost,
                        event_count: p.event_count,
                    })
                    .collect()
            } else {
                Vec::new()
            };
            UsageAnalyticItem {
                feature_id: item.feature_id,
                feature_name: item.feature_name,
                event_name: item.event_name,
                source: item.source,
                unit: item.unit,
                unit_plural: item.unit_plural,
                aggregation_type: aggregation,
                total_usage,
                total_cost: item.total_cost,
                currency: item.currency,
                event_count: item.event_count,
                properties: item.properties,
                points,
            }
        })
        .collect();

    out.sort_by(|a, b| a.feature_name.cmp(&b.feature_name));
    let total_cost = out.iter().map(|i| i.total_cost).sum();
    UsageAnalyticsResponse {
        items: out,
        total_cost,
        currency,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_request_validation() {
        assert!(UsageAnalyticsRequest::default().validate().unwrap_err().is_validation());

        let mut req = UsageAnalyticsRequest::for_customer("cust-1");
        assert_eq!(req.validate().unwrap(), None);

        req.window_size = Some("HOUR".into());
        assert_eq!(req.validate().unwrap(), Some(WindowSize::Hour));

        req.window_size = Some("FORTNIGHT".into());
        assert!(req.validate().unwrap_err().is_validation());

        req.window_size = None;
        req.start_time = Some(Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap());
        req.end_time = Some(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());
        assert!(req.validate().unwrap_err().is_validation());
    }

    #[test]
    fn test_single_currency() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let usd = Subscription::monthly("s1", "c1", "USD", start);
        let usd2 = Subscription::monthly("s2", "c1", "usd", start);
        let eur = Subscription::monthly("s3", "c1", "eur", start);

        assert_eq!(single_currency("c1", &[]).unwrap(), "");
        assert_eq!(single_currency("c1", &[usd.clone(), usd2]).unwrap(), "usd");
        assert!(single_currency("c1", &[usd, eur]).unwrap_err().is_validation());
    }

    #[test]
    fn test_max_bucket_discovery() {
        use tallyline_common::MeterAggregation;

        let mut bucketed = MeterAggregation::new(AggregationType::Max, "concurrency");
        bucketed.bucket_size = Some(WindowSize::Hour);
        let meters: HashMap<String, Meter> = [
            Meter::new("m-peak", "session", bucketed),
            Meter::new("m-max", "session", MeterAggregation::new(AggregationType::Max, "concurrency")),
        ]
        .into_iter()
        .map(|m| (m.id.clone(), m))
        .collect();
        let features = vec![
            Feature::new("f-peak", "Peak sessions", "m-peak"),
            Feature::new("f-max", "Max sessions", "m-max"),
            Feature::new("f-orphan", "Orphan", "m-missing"),
        ];

        let found = max_bucket_features(&features, &meters);
        assert_eq!(found.len(), 1);
        assert_eq!(found["f-peak"].bucket_size, WindowSize::Hour);
    }
}
