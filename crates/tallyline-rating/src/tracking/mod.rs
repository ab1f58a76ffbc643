//! Usage tracking
//!
//! The streaming side of rating: collaborator contracts, billing target
//! resolvers, the generic fan-out pipeline with its consumer lanes, backfill
//! reprocessing, and the analytics service built on the same metering and
//! pricing steps.

pub mod analytics;
pub mod backfill;
pub mod memory;
pub mod metrics;
pub mod pipeline;
pub mod repository;
pub mod resolver;

pub use analytics::{
    UsageAnalyticItem, UsageAnalyticPointItem, UsageAnalyticsRequest, UsageAnalyticsResponse,
    UsageAnalyticsService,
};
pub use backfill::{ReprocessParams, ReprocessSummary, Reprocessor};
pub use memory::{CatalogSeed, InMemoryStore, InMemoryUsageSink};
pub use metrics::PipelineMetrics;
pub use pipeline::{EventPublisher, LaneSettings, TrackingPipeline};
pub use repository::{
    CostSheetRepository, CustomerRepository, EventCursor, FeatureQuery, FeatureRepository, MaxBucketFeature,
    MeterQuery, MeterRepository, PriceQuery, PriceRepository, SubscriptionQuery, SubscriptionRepository,
    TenantScope, UnprocessedEventSource, UnprocessedQuery, UsageAnalyticsParams, UsageAnalyticsStore, UsageSink,
};
pub use resolver::{
    BillingTarget, CatalogLookups, CostSheetResolver, RatedMatch, RatingCatalog, ResolvedTargets,
    SubscriptionResolver, TargetResolver,
};

/// Subscription usage pipeline
pub type FeatureUsagePipeline = TrackingPipeline<SubscriptionResolver>;
/// Cost-sheet usage pipeline
pub type CostUsagePipeline = TrackingPipeline<CostSheetResolver>;
