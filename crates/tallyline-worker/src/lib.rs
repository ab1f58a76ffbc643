//! # Tallyline Worker
//!
//! Runs the subscription-usage and cost-sheet-usage tracking pipelines as
//! queue consumers. Each pipeline gets a primary lane, a backfill lane and
//! optionally a lazy lane, each with its own consumer group and rate limit.
//!
//! Without a NATS URL the worker runs standalone on the in-process bus,
//! with the catalog seeded from a JSON file.

pub mod app;
pub mod config;

pub use app::{http_router, render_metrics, Services};
pub use config::WorkerConfig;
