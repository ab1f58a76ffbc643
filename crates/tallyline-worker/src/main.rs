//! Tallyline worker binary

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tallyline_rating::tracking::InMemoryStore;
use tallyline_rating::transport::{InMemoryBus, NatsTransport, Publisher, Router, Subscriber};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tallyline_worker::{http_router, Services, WorkerConfig};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("TALLYLINE_LOG_FORMAT").map_or(false, |f| f.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Received shutdown signal");
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    info!("Starting Tallyline worker v{}", tallyline_common::VERSION);

    let config = WorkerConfig::load()?;
    info!(?config, "Loaded configuration");

    let store = Arc::new(match &config.catalog_path {
        Some(path) => InMemoryStore::from_json_file(path)?,
        None => InMemoryStore::new(),
    });

    let standalone = config.nats.is_standalone();
    let (publisher, subscriber): (Arc<dyn Publisher>, Arc<dyn Subscriber>) = if standalone {
        info!("No NATS URL configured, running on the in-process bus");
        let bus = Arc::new(InMemoryBus::new());
        (bus.clone(), bus)
    } else {
        let nats = Arc::new(NatsTransport::connect(&config.nats.url, config.nats.stream_name(), config.subjects()).await?);
        (nats.clone(), nats)
    };

    let services = Services::build(&config, store, publisher)?;
    let mut router = Router::new(subscriber);
    services.register(&mut router, config.lazy_lanes)?;
    let lanes = router.run().await?;

    if standalone {
        let summary = services.backfill_event_log().await?;
        info!(
            found = summary.found,
            published = summary.published,
            "Queued seeded events for rating"
        );
    }

    let addr: SocketAddr = config.metrics.listen.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Serving /metrics and /health");

    axum::serve(listener, http_router(services.registry.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    lanes.shutdown().await;
    info!("Tallyline worker stopped");
    Ok(())
}
