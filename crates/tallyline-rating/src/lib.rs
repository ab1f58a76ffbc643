//! # Tallyline Rating
//!
//! Turns raw usage events into billable usage records and prices them.
//!
//! ## Flow
//!
//! ```text
//! event ──► customer ──► targets ──► match ──► extract ──► hash ──► sink
//!                        (subscriptions | cost sheet)
//! ```
//!
//! - [`metering`]: matcher, dedup hasher, quantity extractor, analytics rows
//! - [`pricing`]: flat, package and tiered cost with a sorted-tier cache
//! - [`tracking`]: fan-out pipeline, backfill and usage analytics
//! - [`transport`]: at-least-once queue abstraction and rate-limited lanes

pub mod metering;
pub mod pricing;
pub mod tracking;
pub mod transport;

pub use metering::{extract, match_prices, unique_hash, DetailedUsageAnalytic, Extracted, PriceMatch};
pub use pricing::{PricingEngine, TierCache};
pub use tracking::{
    CostSheetResolver, CostUsagePipeline, FeatureUsagePipeline, LaneSettings, Reprocessor, SubscriptionResolver,
    TrackingPipeline, UsageAnalyticsService,
};
pub use transport::{InMemoryBus, Message, NatsTransport, Router};
