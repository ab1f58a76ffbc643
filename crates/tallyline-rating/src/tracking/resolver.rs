//! Billing target resolution
//!
//! A tracking pipeline rates an event against one or more billing targets.
//! [`SubscriptionResolver`] fans out across the customer's billable
//! subscriptions; [`CostSheetResolver`] rates against the tenant's single
//! active cost sheet.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tallyline_common::{
    CostUsage, Customer, Event, Feature, Meter, Price, PriceEntityType, Result, UsageFact, UsageRecord, USAGE_SIGN,
};
use tracing::{debug, instrument, warn};

use super::repository::{
    CostSheetRepository, FeatureQuery, FeatureRepository, MeterQuery, MeterRepository, PriceQuery, PriceRepository,
    SubscriptionQuery, SubscriptionRepository, TenantScope,
};
use crate::metering::PeriodContext;

/// Meters and features referenced by a set of prices
#[derive(Debug, Clone, Default)]
pub struct RatingCatalog {
    pub meters: HashMap<String, Meter>,
    pub features_by_meter: HashMap<String, Feature>,
}

/// Something an event is rated against
#[derive(Debug, Clone)]
pub struct BillingTarget {
    /// Subscription or cost sheet ID
    pub id: String,
    pub prices: Vec<Price>,
    /// Price ID to the line item carrying it
    pub line_items: HashMap<String, String>,
    /// Epoch-ms billing period start, 0 when the target has no periods
    pub period_id: u64,
    pub period: Option<PeriodContext>,
}

#[derive(Debug, Clone, Default)]
pub struct ResolvedTargets {
    pub catalog: RatingCatalog,
    pub targets: Vec<BillingTarget>,
}

impl ResolvedTargets {
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// One rated (price, meter) match ready to become a record
#[derive(Debug, Clone)]
pub struct RatedMatch<'a> {
    pub price: &'a Price,
    pub meter: &'a Meter,
    pub feature: Option<&'a Feature>,
    pub unique_hash: String,
    pub quantity: Decimal,
}

/// Strategy deciding what an event is billed against
#[async_trait]
pub trait TargetResolver: Send + Sync + 'static {
    type Record: UsageRecord;

    /// Pipeline name, used for handler names and metric labels
    fn name(&self) -> &'static str;

    async fn resolve_targets(&self, scope: &TenantScope, customer: &Customer, event: &Event)
        -> Result<ResolvedTargets>;

    fn build_record(&self, event: &Event, target: &BillingTarget, rated: RatedMatch<'_>) -> Self::Record;
}

/// Batched meter and feature lookups for a set of prices
#[derive(Clone)]
pub struct CatalogLookups {
    pub prices: Arc<dyn PriceRepository>,
    pub meters: Arc<dyn MeterRepository>,
    pub features: Arc<dyn FeatureRepository>,
}

impl CatalogLookups {
    pub fn new(
        prices: Arc<dyn PriceRepository>,
        meters: Arc<dyn MeterRepository>,
        features: Arc<dyn FeatureRepository>,
    ) -> Self {
        Self {
            prices,
            meters,
            features,
        }
    }

    /// One meter lookup and one feature lookup covering every price
    pub async fn load(&self, scope: &TenantScope, prices: &[Price]) -> Result<RatingCatalog> {
        let meter_ids: Vec<String> = prices
            .iter()
            .filter_map(|p| p.meter_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if meter_ids.is_empty() {
            return Ok(RatingCatalog::default());
        }

        let meters = self
            .meters
            .list(scope, &MeterQuery { ids: Some(meter_ids.clone()) })
            .await?;
        let features = self
            .features
            .list(
                scope,
                &FeatureQuery {
                    ids: None,
                    meter_ids: Some(meter_ids),
                },
            )
            .await?;

        Ok(RatingCatalog {
            meters: meters.into_iter().map(|m| (m.id.clone(), m)).collect(),
            features_by_meter: features.into_iter().map(|f| (f.meter_id.clone(), f)).collect(),
        })
    }
}

/// Fan-out across the customer's active and trialing subscriptions
pub struct SubscriptionResolver {
    subscriptions: Arc<dyn SubscriptionRepository>,
    catalog: CatalogLookups,
}

impl SubscriptionResolver {
    pub fn new(subscriptions: Arc<dyn SubscriptionRepository>, catalog: CatalogLookups) -> Self {
        Self { subscriptions, catalog }
    }
}

#[async_trait]
impl TargetResolver for SubscriptionResolver {
    type Record = UsageFact;

    fn name(&self) -> &'static str {
        "feature_usage_tracking"
    }

    #[instrument(skip_all, fields(event_id = %event.id, customer_id = %customer.id))]
    async fn resolve_targets(
        &self,
        scope: &TenantScope,
        customer: &Customer,
        event: &Event,
    ) -> Result<ResolvedTargets> {
        let subscriptions = self
            .subscriptions
            .list(scope, &SubscriptionQuery::billable(customer.id.clone()))
            .await?;
        if subscriptions.is_empty() {
            debug!("No active subscriptions");
            return Ok(ResolvedTargets::default());
        }

        // (subscription, period id, line items) valid for the event
        let mut candidates = Vec::new();
        for sub in &subscriptions {
            if !sub.is_valid_for(event.timestamp) {
                debug!(subscription_id = %sub.id, "Subscription not valid at event time");
                continue;
            }
            let period_id = match sub.period_id(event.timestamp) {
                Ok(id) => id,
                Err(e) => {
                    warn!(subscription_id = %sub.id, error = %e, "Failed to compute period, skipping subscription");
                    continue;
                }
            };
            let items: Vec<_> = sub.active_usage_items(event.timestamp).collect();
            if !items.is_empty() {
                candidates.push((sub, period_id, items));
            }
        }

        let price_ids: Vec<String> = candidates
            .iter()
            .flat_map(|(_, _, items)| items.iter().map(|i| i.price_id.clone()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if price_ids.is_empty() {
            debug!("No usage line items active at event time");
            return Ok(ResolvedTargets::default());
        }

        let prices = self.catalog.prices.list(scope, &PriceQuery::by_ids(price_ids)).await?;
        let catalog = self.catalog.load(scope, &prices).await?;
        let price_by_id: HashMap<&str, &Price> = prices.iter().map(|p| (p.id.as_str(), p)).collect();

        let targets = candidates
            .into_iter()
            .map(|(sub, period_id, items)| {
                let mut target_prices = Vec::with_capacity(items.len());
                let mut line_items = HashMap::with_capacity(items.len());
                for item in items {
                    match price_by_id.get(item.price_id.as_str()) {
                        Some(price) => {
                            target_prices.push((*price).clone());
                            line_items.insert(item.price_id.clone(), item.id.clone());
                        }
                        None => debug!(line_item_id = %item.id, price_id = %item.price_id, "Price not found"),
                    }
                }
                BillingTarget {
                    id: sub.id.clone(),
                    prices: target_prices,
                    line_items,
                    period_id,
                    period: Some(PeriodContext::from_period_id(period_id, sub.cadence())),
                }
            })
            .collect();

        Ok(ResolvedTargets { catalog, targets })
    }

    fn build_record(&self, event: &Event, target: &BillingTarget, rated: RatedMatch<'_>) -> UsageFact {
        UsageFact {
            event: event.clone(),
            subscription_id: target.id.clone(),
            sub_line_item_id: target.line_items.get(&rated.price.id).cloned().unwrap_or_default(),
            price_id: rated.price.id.clone(),
            meter_id: rated.meter.id.clone(),
            feature_id: rated.feature.map(|f| f.id.clone()),
            period_id: target.period_id,
            unique_hash: rated.unique_hash,
            sign: USAGE_SIGN,
            qty_total: rated.quantity,
        }
    }
}

/// Rates events against the tenant's active cost sheet
pub struct CostSheetResolver {
    cost_sheets: Arc<dyn CostSheetRepository>,
    catalog: CatalogLookups,
}

impl CostSheetResolver {
    pub fn new(cost_sheets: Arc<dyn CostSheetRepository>, catalog: CatalogLookups) -> Self {
        Self { cost_sheets, catalog }
    }
}

#[async_trait]
impl TargetResolver for CostSheetResolver {
    type Record = CostUsage;

    fn name(&self) -> &'static str {
        "cost_usage_tracking"
    }

    #[instrument(skip_all, fields(event_id = %event.id))]
    async fn resolve_targets(
        &self,
        scope: &TenantScope,
        _customer: &Customer,
        event: &Event,
    ) -> Result<ResolvedTargets> {
        let sheet = match self.cost_sheets.get_active(scope).await {
            Ok(Some(sheet)) => sheet,
            Ok(None) => {
                debug!(tenant_id = %scope.tenant_id, "No active cost sheet");
                return Ok(ResolvedTargets::default());
            }
            Err(e) if e.is_not_found() => {
                debug!(tenant_id = %scope.tenant_id, "No active cost sheet");
                return Ok(ResolvedTargets::default());
            }
            Err(e) => return Err(e),
        };

        let prices: Vec<Price> = self
            .catalog
            .prices
            .list(scope, &PriceQuery::by_entity(PriceEntityType::Costsheet, sheet.id.clone()))
            .await?
            .into_iter()
            .filter(Price::is_usage)
            .collect();
        if prices.is_empty() {
            debug!(cost_sheet_id = %sheet.id, "Cost sheet has no usage prices");
            return Ok(ResolvedTargets::default());
        }

        let catalog = self.catalog.load(scope, &prices).await?;
        Ok(ResolvedTargets {
            catalog,
            targets: vec![BillingTarget {
                id: sheet.id,
                prices,
                line_items: HashMap::new(),
                period_id: 0,
                period: None,
            }],
        })
    }

    fn build_record(&self, event: &Event, target: &BillingTarget, rated: RatedMatch<'_>) -> CostUsage {
        CostUsage {
            event: event.clone(),
            cost_sheet_id: target.id.clone(),
            price_id: rated.price.id.clone(),
            meter_id: rated.meter.id.clone(),
            feature_id: rated.feature.map(|f| f.id.clone()),
            unique_hash: rated.unique_hash,
            sign: USAGE_SIGN,
            qty_total: rated.quantity,
        }
    }
}
