//! Worker wiring
//!
//! Builds both tracking pipelines over one catalog and one transport,
//! registers their lanes on a router and serves `/metrics` and `/health`.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router as HttpRouter};
use chrono::{DateTime, Duration, Utc};
use prometheus::{Encoder, Registry, TextEncoder};
use std::collections::BTreeMap;
use std::sync::Arc;
use tallyline_common::{CostUsage, Result, TallyError, UsageFact};
use tallyline_rating::tracking::{
    CatalogLookups, CostSheetResolver, CostUsagePipeline, FeatureUsagePipeline, InMemoryStore, InMemoryUsageSink,
    ReprocessParams, ReprocessSummary, Reprocessor, SubscriptionResolver, TenantScope, TrackingPipeline,
    UsageAnalyticsService,
};
use tallyline_rating::transport::{Publisher, Router};
use tallyline_rating::PricingEngine;
use tracing::info;

use crate::config::WorkerConfig;

/// Everything the worker runs
pub struct Services {
    pub store: Arc<InMemoryStore>,
    pub feature_sink: Arc<InMemoryUsageSink<UsageFact>>,
    pub cost_sink: Arc<InMemoryUsageSink<CostUsage>>,
    pub feature_usage: Arc<FeatureUsagePipeline>,
    pub cost_usage: Arc<CostUsagePipeline>,
    pub registry: Registry,
}

impl Services {
    /// Wire both pipelines; `publisher` serves both the primary and backfill lanes
    pub fn build(config: &WorkerConfig, store: Arc<InMemoryStore>, publisher: Arc<dyn Publisher>) -> Result<Self> {
        let lookups = CatalogLookups::new(store.clone(), store.clone(), store.clone());
        let feature_sink = Arc::new(InMemoryUsageSink::<UsageFact>::new().with_event_log(store.clone()));
        let cost_sink = Arc::new(InMemoryUsageSink::<CostUsage>::new().with_event_log(store.clone()));

        let feature_usage = TrackingPipeline::new(
            SubscriptionResolver::new(store.clone(), lookups.clone()),
            store.clone(),
            feature_sink.clone(),
            publisher.clone(),
            config.feature_usage.clone(),
        )?
        .with_backfill_publisher(publisher.clone());

        let cost_usage = TrackingPipeline::new(
            CostSheetResolver::new(store.clone(), lookups),
            store.clone(),
            cost_sink.clone(),
            publisher.clone(),
            config.cost_usage.clone(),
        )?
        .with_backfill_publisher(publisher);

        let registry = Registry::new();
        feature_usage.metrics().register(&registry)?;
        cost_usage.metrics().register(&registry)?;

        Ok(Self {
            store,
            feature_sink,
            cost_sink,
            feature_usage: Arc::new(feature_usage),
            cost_usage: Arc::new(cost_usage),
            registry,
        })
    }

    /// Primary and backfill lanes of both pipelines, plus the lazy lanes when enabled
    pub fn register(&self, router: &mut Router, lazy_lanes: bool) -> Result<()> {
        self.feature_usage.register_handlers(router)?;
        self.cost_usage.register_handlers(router)?;
        if lazy_lanes {
            self.feature_usage.register_lazy_handler(router)?;
            self.cost_usage.register_lazy_handler(router)?;
        }
        info!(handlers = router.len(), "Registered tracking handlers");
        Ok(())
    }

    /// Backfill over subscription usage not yet rated
    pub fn feature_reprocessor(&self) -> Reprocessor {
        Reprocessor::new(self.feature_sink.clone(), self.feature_usage.clone())
    }

    /// Backfill over cost-sheet usage not yet rated
    pub fn cost_reprocessor(&self) -> Reprocessor {
        Reprocessor::new(self.cost_sink.clone(), self.cost_usage.clone())
    }

    /// Republish every logged event not yet rated by either pipeline
    pub async fn backfill_event_log(&self) -> Result<ReprocessSummary> {
        let mut ranges: BTreeMap<(String, String), (DateTime<Utc>, DateTime<Utc>)> = BTreeMap::new();
        for event in self.store.events() {
            let range = ranges
                .entry((event.tenant_id.clone(), event.environment_id.clone()))
                .or_insert((event.timestamp, event.timestamp));
            range.0 = range.0.min(event.timestamp);
            range.1 = range.1.max(event.timestamp);
        }

        let mut total = ReprocessSummary::default();
        for ((tenant_id, environment_id), (start, last)) in ranges {
            let scope = TenantScope::new(tenant_id, environment_id);
            let params = ReprocessParams::new(start, last + Duration::milliseconds(1));
            for reprocessor in [self.feature_reprocessor(), self.cost_reprocessor()] {
                let summary = reprocessor.reprocess(&scope, &params).await?;
                total.batches += summary.batches;
                total.found += summary.found;
                total.published += summary.published;
            }
        }
        Ok(total)
    }

    pub fn analytics(&self) -> UsageAnalyticsService {
        UsageAnalyticsService::new(
            self.store.clone(),
            self.store.clone(),
            CatalogLookups::new(self.store.clone(), self.store.clone(), self.store.clone()),
            self.feature_sink.clone(),
            PricingEngine::new(),
        )
    }
}

/// Prometheus text exposition of `registry`
pub fn render_metrics(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .map_err(|e| TallyError::Internal(format!("encode metrics: {}", e)))?;
    String::from_utf8(buffer).map_err(|e| TallyError::Internal(format!("encode metrics: {}", e)))
}

async fn metrics(State(registry): State<Registry>) -> impl IntoResponse {
    match render_metrics(&registry) {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "healthy", "version": tallyline_common::VERSION }))
}

/// `/metrics` and `/health`
pub fn http_router(registry: Registry) -> HttpRouter {
    HttpRouter::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(registry)
}
