//! # Tallyline Common
//!
//! Shared data model, errors, and calendar math for the Tallyline usage
//! rating pipeline.
//!
//! ## Core Types
//!
//! - [`Event`]: immutable usage event with a typed [`PropertyValue`] bag
//! - [`Meter`]: metric definition (aggregation + property filters)
//! - [`Price`]: flat, package or tiered price, optionally tied to a meter
//! - [`Subscription`]: billing contract with usage line items
//! - [`UsageFact`]/[`CostUsage`]: rated records keyed by a dedup hash
//!
//! ## Calendar
//!
//! - [`period`]: billing cadence arithmetic and period IDs
//! - [`currency`]: minor-unit precision and rounding

pub mod currency;
pub mod error;
pub mod period;
pub mod types;

// Re-export commonly used types at crate root
pub use error::{PeriodError, PricingError, Result, TallyError};
pub use period::{BillingPeriod, Cadence};
pub use types::{
    cost_sheet::CostSheet,
    customer::Customer,
    event::{CoercionError, Event, PropertyValue},
    feature::Feature,
    meter::{AggregationType, Meter, MeterAggregation, MeterFilter, WindowSize},
    price::{
        BillingModel, Price, PriceEntityType, PriceTier, PriceType, RoundMode, Status, TierMode,
        TransformQuantity,
    },
    subscription::{Subscription, SubscriptionLineItem, SubscriptionStatus},
    usage::{CostUsage, UsageFact, UsageRecord},
};

/// Tallyline version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Sign of every emitted usage record
pub const USAGE_SIGN: i8 = 1;
