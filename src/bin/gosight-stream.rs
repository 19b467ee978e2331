//! GoSight stream-processing core server
//!
//! Consumes the raw event and replay topics, maintains live session
//! aggregates, derives behavioural insights, and writes everything to the
//! analytics store. Serves health and Prometheus metrics over HTTP.

use anyhow::Context;
use tracing::info;

use gosight_stream::{AppConfig, Pipeline};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gosight_stream=info,tower_http=warn".into()),
        )
        .init();

    info!("Starting GoSight stream core v{}", gosight_stream::VERSION);

    let config = AppConfig::load().context("Failed to load configuration")?;
    info!(
        brokers = %config.kafka.brokers,
        events_topic = %config.kafka.topics.events,
        "Configuration loaded"
    );

    let pipeline = Pipeline::new(config)
        .await
        .context("Failed to assemble the pipeline")?;

    pipeline.run().await.context("Pipeline terminated")?;

    Ok(())
}
