//! Rated usage records emitted by the tracking pipelines

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::event::Event;

/// Common view over emitted usage records, keyed by their dedup hash
pub trait UsageRecord: Clone + Send + Sync + 'static {
    fn event(&self) -> &Event;
    fn unique_hash(&self) -> &str;
    fn price_id(&self) -> &str;
    fn meter_id(&self) -> &str;
    fn feature_id(&self) -> Option<&str>;
    fn qty_total(&self) -> Decimal;
    /// Storage uniqueness key: the hash scoped to what the record bills against
    fn dedup_key(&self) -> String;
}

/// Billable usage of one event under one subscription price
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageFact {
    #[serde(flatten)]
    pub event: Event,
    pub subscription_id: String,
    pub sub_line_item_id: String,
    pub price_id: String,
    pub meter_id: String,
    #[serde(default)]
    pub feature_id: Option<String>,
    /// Epoch-ms start of the billing period
    pub period_id: u64,
    pub unique_hash: String,
    /// Reserved for credit/debit netting, always +1
    pub sign: i8,
    pub qty_total: Decimal,
}

impl UsageRecord for UsageFact {
    fn event(&self) -> &Event {
        &self.event
    }

    fn unique_hash(&self) -> &str {
        &self.unique_hash
    }

    fn price_id(&self) -> &str {
        &self.price_id
    }

    fn meter_id(&self) -> &str {
        &self.meter_id
    }

    fn feature_id(&self) -> Option<&str> {
        self.feature_id.as_deref()
    }

    fn qty_total(&self) -> Decimal {
        self.qty_total
    }

    fn dedup_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.subscription_id, self.meter_id, self.period_id, self.unique_hash
        )
    }
}

/// Internal cost of one event under the tenant's cost sheet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostUsage {
    #[serde(flatten)]
    pub event: Event,
    pub cost_sheet_id: String,
    pub price_id: String,
    pub meter_id: String,
    #[serde(default)]
    pub feature_id: Option<String>,
    pub unique_hash: String,
    pub sign: i8,
    pub qty_total: Decimal,
}

impl UsageRecord for CostUsage {
    fn event(&self) -> &Event {
        &self.event
    }

    fn unique_hash(&self) -> &str {
        &self.unique_hash
    }

    fn price_id(&self) -> &str {
        &self.price_id
    }

    fn meter_id(&self) -> &str {
        &self.meter_id
    }

    fn feature_id(&self) -> Option<&str> {
        self.feature_id.as_deref()
    }

    fn qty_total(&self) -> Decimal {
        self.qty_total
    }

    fn dedup_key(&self) -> String {
        format!("{}:{}:{}", self.cost_sheet_id, self.meter_id, self.unique_hash)
    }
}
