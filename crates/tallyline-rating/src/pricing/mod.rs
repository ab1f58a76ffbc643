//! Pricing module
//!
//! Provides quantity-to-money conversion with:
//! - Flat, package, volume and slab billing models
//! - Currency-precision rounding
//! - Sorted-tier caching keyed by price version

pub mod cache;
pub mod engine;

pub use cache::{sort_tiers, CacheStats, TierCache};
pub use engine::PricingEngine;
