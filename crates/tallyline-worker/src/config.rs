//! Worker configuration
//!
//! Sources, later overriding earlier:
//! 1. built-in defaults
//! 2. `tallyline.toml` in the working directory (optional)
//! 3. `TALLYLINE__`-prefixed environment variables, `__` between sections
//!    (e.g. `TALLYLINE__NATS__URL`, `TALLYLINE__FEATURE_USAGE__RATE_LIMIT`)

use anyhow::Result;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tallyline_rating::LaneSettings;

pub const CONFIG_FILE: &str = "tallyline";
pub const ENV_PREFIX: &str = "TALLYLINE";

/// Tallyline worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub nats: NatsSettings,
    /// Subscription usage lanes
    pub feature_usage: LaneSettings,
    /// Cost-sheet usage lanes
    pub cost_usage: LaneSettings,
    pub metrics: MetricsSettings,
    /// JSON catalog seeding the in-memory store
    pub catalog_path: Option<String>,
    /// Also consume the lazy lanes
    pub lazy_lanes: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            nats: NatsSettings::default(),
            feature_usage: LaneSettings::named("events.feature_usage"),
            cost_usage: LaneSettings::named("events.cost_usage"),
            metrics: MetricsSettings::default(),
            catalog_path: None,
            lazy_lanes: true,
        }
    }
}

/// NATS JetStream settings; an empty URL runs on the in-process bus
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsSettings {
    pub url: String,
    pub stream: String,
}

impl NatsSettings {
    pub fn is_standalone(&self) -> bool {
        self.url.trim().is_empty()
    }

    pub fn stream_name(&self) -> &str {
        if self.stream.is_empty() {
            "TALLYLINE_EVENTS"
        } else {
            &self.stream
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    /// Listen address of the /metrics and /health server
    pub listen: String,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:9464".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Load configuration from `.env`, `tallyline.toml` and the environment
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let config = Config::builder()
            .add_source(Config::try_from(&Self::default())?)
            .add_source(File::with_name(CONFIG_FILE).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__").try_parsing(true))
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Parse a TOML document over the defaults
    pub fn from_toml(raw: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(Config::try_from(&Self::default())?)
            .add_source(File::from_str(raw, FileFormat::Toml))
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Every topic the worker publishes or consumes
    pub fn subjects(&self) -> Vec<String> {
        let mut subjects: Vec<String> = [&self.feature_usage, &self.cost_usage]
            .into_iter()
            .flat_map(|lanes| [&lanes.topic, &lanes.topic_lazy, &lanes.topic_backfill])
            .filter(|topic| !topic.is_empty())
            .cloned()
            .collect();
        subjects.sort();
        subjects.dedup();
        subjects
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert!(config.nats.is_standalone());
        assert_eq!(config.nats.stream_name(), "TALLYLINE_EVENTS");
        assert_eq!(config.feature_usage.topic, "events.feature_usage");
        assert_eq!(config.cost_usage.consumer_group, "events-cost_usage");
        assert_eq!(config.subjects().len(), 6);
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let config = WorkerConfig::from_toml(
            r#"
            catalog_path = "catalog.json"

            [nats]
            url = "nats://localhost:4222"

            [feature_usage]
            topic = "usage"
            topic_backfill = ""
            rate_limit = 0
            "#,
        )
        .unwrap();

        assert!(!config.nats.is_standalone());
        assert_eq!(config.catalog_path.as_deref(), Some("catalog.json"));
        assert_eq!(config.feature_usage.topic, "usage");
        assert_eq!(config.feature_usage.rate_limit, 0);
        assert_eq!(config.feature_usage.rate_limit_lazy, 10);
        assert_eq!(config.feature_usage.topic_lazy, "events.feature_usage.lazy");
        assert!(config.feature_usage.topic_backfill.is_empty());
        assert_eq!(config.cost_usage.topic, "events.cost_usage");
        assert_eq!(config.metrics.listen, "0.0.0.0:9464");
    }
}
