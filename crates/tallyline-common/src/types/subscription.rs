//! Subscriptions and their line items

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PeriodError;
use crate::period::{calculate_period_id, BillingPeriod, Cadence};
use crate::types::price::{PriceType, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    Paused,
    Cancelled,
    Incomplete,
}

impl SubscriptionStatus {
    /// Statuses that accrue usage
    pub const BILLABLE: [SubscriptionStatus; 2] = [SubscriptionStatus::Active, SubscriptionStatus::Trialing];
}

/// One priced line of a subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionLineItem {
    pub id: String,
    pub price_id: String,
    pub price_type: PriceType,
    #[serde(default)]
    pub meter_id: Option<String>,
    #[serde(default)]
    pub status: Status,
    pub start_date: DateTime<Utc>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
}

impl SubscriptionLineItem {
    pub fn usage(
        id: impl Into<String>,
        price_id: impl Into<String>,
        meter_id: impl Into<String>,
        start_date: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            price_id: price_id.into(),
            price_type: PriceType::Usage,
            meter_id: Some(meter_id.into()),
            status: Status::Published,
            start_date,
            end_date: None,
        }
    }

    pub fn is_usage(&self) -> bool {
        self.price_type == PriceType::Usage && self.meter_id.as_deref().map_or(false, |m| !m.is_empty())
    }

    /// Usage line item, published, with `start <= ts` and no end or `end >= ts`
    pub fn is_active_at(&self, ts: DateTime<Utc>) -> bool {
        self.is_usage()
            && self.status == Status::Published
            && self.start_date <= ts
            && self.end_date.map_or(true, |end| end >= ts)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    #[serde(default)]
    pub tenant_id: String,
    pub customer_id: String,
    pub status: SubscriptionStatus,
    pub currency: String,
    pub start_date: DateTime<Utc>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancelled_at: Option<DateTime<Utc>>,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub billing_anchor: DateTime<Utc>,
    pub billing_period_count: u32,
    pub billing_period: BillingPeriod,
    #[serde(default)]
    pub line_items: Vec<SubscriptionLineItem>,
}

impl Subscription {
    /// Active monthly subscription starting at `start`, anchored on it
    pub fn monthly(
        id: impl Into<String>,
        customer_id: impl Into<String>,
        currency: &str,
        start: DateTime<Utc>,
    ) -> Self {
        let cadence = Cadence::new(start, 1, BillingPeriod::Monthly);
        let current_period_end = cadence.next(start).unwrap_or(start);
        Self {
            id: id.into(),
            tenant_id: String::new(),
            customer_id: customer_id.into(),
            status: SubscriptionStatus::Active,
            currency: currency.to_lowercase(),
            start_date: start,
            end_date: None,
            cancelled_at: None,
            current_period_start: start,
            current_period_end,
            billing_anchor: start,
            billing_period_count: 1,
            billing_period: BillingPeriod::Monthly,
            line_items: Vec::new(),
        }
    }

    pub fn with_line_item(mut self, item: SubscriptionLineItem) -> Self {
        self.line_items.push(item);
        self
    }

    pub fn cadence(&self) -> Cadence {
        Cadence::new(self.billing_anchor, self.billing_period_count, self.billing_period)
    }

    /// Whether an event at `ts` accrues on this subscription.
    ///
    /// The event must be at or after the start and not after the end date or
    /// the cancellation.
    pub fn is_valid_for(&self, ts: DateTime<Utc>) -> bool {
        if ts < self.start_date {
            return false;
        }
        if self.end_date.map_or(false, |end| ts > end) {
            return false;
        }
        if self.cancelled_at.map_or(false, |cancelled| ts > cancelled) {
            return false;
        }
        true
    }

    /// Period ID of the billing period containing `ts`
    pub fn period_id(&self, ts: DateTime<Utc>) -> Result<u64, PeriodError> {
        calculate_period_id(
            ts,
            self.start_date,
            self.current_period_start,
            self.current_period_end,
            &self.cadence(),
        )
    }

    /// Line items eligible to rate an event at `ts`
    pub fn active_usage_items(&self, ts: DateTime<Utc>) -> impl Iterator<Item = &SubscriptionLineItem> {
        self.line_items.iter().filter(move |item| item.is_active_at(ts))
    }
}
