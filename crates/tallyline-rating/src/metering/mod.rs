//! Metering module
//!
//! Provides the per-event rating steps and analytics merging:
//! - matcher: ranks the (price, meter) pairs an event applies to
//! - hasher: deterministic dedup key per billable unit
//! - quantity: billable quantity per aggregation type
//! - aggregator: analytics rows, grouping and point merging

pub mod aggregator;
pub mod hasher;
pub mod matcher;
pub mod quantity;

pub use aggregator::{
    aggregate_by_grouping, grouping_key, merge_points, property_dimension, DetailedUsageAnalytic,
    UsageAccumulator, UsageAnalyticPoint, GROUP_FEATURE_ID, GROUP_PROPERTY_PREFIX, GROUP_SOURCE,
};
pub use hasher::unique_hash;
pub use matcher::{filters_match, match_prices, PriceMatch};
pub use quantity::{extract, Extracted, PeriodContext};
