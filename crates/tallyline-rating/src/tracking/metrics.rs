//! Prometheus counters of a tracking pipeline

use prometheus::{IntCounter, Opts, Registry};
use tallyline_common::{Result, TallyError};

/// Per-pipeline counters, labelled with the pipeline name
#[derive(Clone)]
pub struct PipelineMetrics {
    pub events_processed: IntCounter,
    /// Malformed or cross-tenant messages acknowledged without processing
    pub events_dropped: IntCounter,
    /// Messages left for redelivery
    pub events_failed: IntCounter,
    pub records_emitted: IntCounter,
}

fn counter(name: &str, help: &str, pipeline: &str) -> Result<IntCounter> {
    IntCounter::with_opts(Opts::new(name, help).const_label("pipeline", pipeline))
        .map_err(|e| TallyError::Internal(format!("metric {}: {}", name, e)))
}

impl PipelineMetrics {
    pub fn new(pipeline: &str) -> Result<Self> {
        Ok(Self {
            events_processed: counter(
                "tallyline_events_processed_total",
                "Events rated successfully",
                pipeline,
            )?,
            events_dropped: counter(
                "tallyline_events_dropped_total",
                "Messages dropped as unprocessable",
                pipeline,
            )?,
            events_failed: counter(
                "tallyline_events_failed_total",
                "Events that failed and will be redelivered",
                pipeline,
            )?,
            records_emitted: counter(
                "tallyline_usage_records_emitted_total",
                "Usage records handed to the sink",
                pipeline,
            )?,
        })
    }

    pub fn register(&self, registry: &Registry) -> Result<()> {
        let collectors = [
            &self.events_processed,
            &self.events_dropped,
            &self.events_failed,
            &self.records_emitted,
        ];
        for collector in collectors {
            registry
                .register(Box::new(collector.clone()))
                .map_err(|e| TallyError::Internal(format!("register metrics: {}", e)))?;
        }
        Ok(())
    }
}
