//! Usage analytics rows and their merge rules
//!
//! The analytics store returns one row per feature and requested dimension
//! values. When the caller groups by anything other than `feature_id`, rows
//! sharing the same dimension values are merged here: sums add, maxima and
//! latest values take the greater value, time-series points merge by
//! timestamp.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tallyline_common::AggregationType;

/// Grouping dimension for feature IDs
pub const GROUP_FEATURE_ID: &str = "feature_id";
/// Grouping dimension for event sources
pub const GROUP_SOURCE: &str = "source";
/// Prefix of property grouping dimensions
pub const GROUP_PROPERTY_PREFIX: &str = "properties.";

/// One time bucket of a usage row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageAnalyticPoint {
    pub timestamp: DateTime<Utc>,
    pub usage: Decimal,
    pub max_usage: Decimal,
    pub latest_usage: Decimal,
    pub count_unique_usage: u64,
    pub event_count: u64,
    pub cost: Decimal,
}

impl UsageAnalyticPoint {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            usage: Decimal::ZERO,
            max_usage: Decimal::ZERO,
            latest_usage: Decimal::ZERO,
            count_unique_usage: 0,
            event_count: 0,
            cost: Decimal::ZERO,
        }
    }

    fn absorb(&mut self, other: &UsageAnalyticPoint) {
        self.usage += other.usage;
        self.max_usage = self.max_usage.max(other.max_usage);
        self.latest_usage = self.latest_usage.max(other.latest_usage);
        self.count_unique_usage += other.count_unique_usage;
        self.event_count += other.event_count;
        self.cost += other.cost;
    }

    /// Usage figure that matches the meter's aggregation
    pub fn usage_for(&self, aggregation: Option<AggregationType>) -> Decimal {
        pick_usage(
            aggregation,
            self.usage,
            self.max_usage,
            self.latest_usage,
            self.count_unique_usage,
        )
    }
}

/// Usage of one feature (or one merged group) over the query window
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DetailedUsageAnalytic {
    pub feature_id: String,
    pub feature_name: String,
    pub meter_id: String,
    pub event_name: String,
    pub source: String,
    pub unit: String,
    pub unit_plural: String,
    pub aggregation_type: Option<AggregationType>,
    pub total_usage: Decimal,
    pub max_usage: Decimal,
    pub latest_usage: Decimal,
    pub count_unique_usage: u64,
    pub event_count: u64,
    pub total_cost: Decimal,
    pub currency: String,
    pub properties: BTreeMap<String, String>,
    pub points: Vec<UsageAnalyticPoint>,
}

impl DetailedUsageAnalytic {
    pub fn new(feature_id: impl Into<String>) -> Self {
        Self {
            feature_id: feature_id.into(),
            ..Default::default()
        }
    }

    /// Usage figure that matches the meter's aggregation
    pub fn usage_for(&self, aggregation: Option<AggregationType>) -> Decimal {
        pick_usage(
            aggregation,
            self.total_usage,
            self.max_usage,
            self.latest_usage,
            self.count_unique_usage,
        )
    }

    fn absorb(&mut self, other: &DetailedUsageAnalytic) {
        self.total_usage += other.total_usage;
        self.max_usage = self.max_usage.max(other.max_usage);
        self.latest_usage = self.latest_usage.max(other.latest_usage);
        self.count_unique_usage += other.count_unique_usage;
        self.event_count += other.event_count;
        self.total_cost += other.total_cost;
        let existing = std::mem::take(&mut self.points);
        self.points = merge_points(existing, &other.points);
    }
}

fn pick_usage(
    aggregation: Option<AggregationType>,
    sum: Decimal,
    max: Decimal,
    latest: Decimal,
    count_unique: u64,
) -> Decimal {
    match aggregation {
        Some(AggregationType::CountUnique) => Decimal::from(count_unique),
        Some(AggregationType::Max) => max,
        Some(AggregationType::Latest) => latest,
        _ => sum,
    }
}

/// Property name of a `properties.<name>` dimension
pub fn property_dimension(group: &str) -> Option<&str> {
    group.strip_prefix(GROUP_PROPERTY_PREFIX)
}

/// Whether rows must be merged for this grouping
pub fn needs_merge(group_by: &[String]) -> bool {
    !(group_by.is_empty() || (group_by.len() == 1 && group_by[0] == GROUP_FEATURE_ID))
}

/// Pipe-joined values of the requested dimensions, in request order
pub fn grouping_key(item: &DetailedUsageAnalytic, group_by: &[String]) -> String {
    let parts: Vec<&str> = group_by
        .iter()
        .filter_map(|group| match group.as_str() {
            GROUP_FEATURE_ID => Some(item.feature_id.as_str()),
            GROUP_SOURCE => Some(item.source.as_str()),
            other => property_dimension(other)
                .map(|name| item.properties.get(name).map(String::as_str).unwrap_or("")),
        })
        .collect();
    parts.join("|")
}

/// Merge rows sharing the same grouping key, keeping first-seen order.
///
/// Merged rows keep only the identifying fields that were grouped on.
pub fn aggregate_by_grouping(
    items: Vec<DetailedUsageAnalytic>,
    group_by: &[String],
) -> Vec<DetailedUsageAnalytic> {
    if !needs_merge(group_by) {
        return items;
    }

    let mut index: HashMap<String, usize> = HashMap::new();
    let mut merged: Vec<DetailedUsageAnalytic> = Vec::new();

    for item in items {
        let key = grouping_key(&item, group_by);
        match index.get(&key) {
            Some(&i) => merged[i].absorb(&item),
            None => {
                let mut group = item.clone();
                group.feature_id.clear();
                group.source.clear();
                group.properties.clear();
                for dim in group_by {
                    match dim.as_str() {
                        GROUP_FEATURE_ID => group.feature_id = item.feature_id.clone(),
                        GROUP_SOURCE => group.source = item.source.clone(),
                        other => {
                            if let Some(name) = property_dimension(other) {
                                if let Some(value) = item.properties.get(name) {
                                    group.properties.insert(name.to_string(), value.clone());
                                }
                            }
                        }
                    }
                }
                index.insert(key, merged.len());
                merged.push(group);
            }
        }
    }

    merged
}

/// Merge two point series by exact timestamp, sorted ascending
pub fn merge_points(
    existing: Vec<UsageAnalyticPoint>,
    incoming: &[UsageAnalyticPoint],
) -> Vec<UsageAnalyticPoint> {
    let mut by_ts: BTreeMap<DateTime<Utc>, UsageAnalyticPoint> = BTreeMap::new();
    for point in existing.into_iter() {
        match by_ts.get_mut(&point.timestamp) {
            Some(current) => current.absorb(&point),
            None => {
                by_ts.insert(point.timestamp, point);
            }
        }
    }
    for point in incoming {
        match by_ts.get_mut(&point.timestamp) {
            Some(current) => current.absorb(point),
            None => {
                by_ts.insert(point.timestamp, point.clone());
            }
        }
    }
    by_ts.into_values().collect()
}

/// Running totals for one row or point while scanning usage records
#[derive(Debug, Clone, Default)]
pub struct UsageAccumulator {
    sum: Decimal,
    max: Option<Decimal>,
    latest: Option<(DateTime<Utc>, Decimal)>,
    unique_hashes: HashSet<String>,
    event_ids: HashSet<String>,
}

impl UsageAccumulator {
    pub fn record(&mut self, event_id: &str, unique_hash: &str, timestamp: DateTime<Utc>, quantity: Decimal) {
        self.sum += quantity;
        self.max = Some(self.max.map_or(quantity, |m| m.max(quantity)));
        if self.latest.map_or(true, |(ts, _)| timestamp >= ts) {
            self.latest = Some((timestamp, quantity));
        }
        self.unique_hashes.insert(unique_hash.to_string());
        self.event_ids.insert(event_id.to_string());
    }

    pub fn sum(&self) -> Decimal {
        self.sum
    }

    pub fn max(&self) -> Decimal {
        self.max.unwrap_or(Decimal::ZERO)
    }

    pub fn latest(&self) -> Decimal {
        self.latest.map_or(Decimal::ZERO, |(_, q)| q)
    }

    pub fn count_unique(&self) -> u64 {
        self.unique_hashes.len() as u64
    }

    pub fn event_count(&self) -> u64 {
        self.event_ids.len() as u64
    }

    pub fn to_point(&self, timestamp: DateTime<Utc>) -> UsageAnalyticPoint {
        UsageAnalyticPoint {
            timestamp,
            usage: self.sum(),
            max_usage: self.max(),
            latest_usage: self.latest(),
            count_unique_usage: self.count_unique(),
            event_count: self.event_count(),
            cost: Decimal::ZERO,
        }
    }
}
