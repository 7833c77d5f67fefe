//! order-fanout service
//!
//! Consumes order messages from Kafka and fans each one out to the configured
//! sinks.

use std::sync::Arc;

use order_fanout::config::Config;
use order_fanout::credentials::{CredentialCache, KeyVaultSecretProvider};
use order_fanout::db::{create_pool, run_migrations, PgDocumentStore};
use order_fanout::error::{Error, Result};
use order_fanout::logging;
use order_fanout::pipeline::OrderPipeline;
use order_fanout::sinks::{EventGridPublisher, EventHubsClientFactory, EventHubsPublisher};
use order_fanout::trigger::{shutdown_signal, OrderConsumer};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration from environment
    let config = Config::from_env()?;

    // Validate configuration
    config.validate()?;

    // Initialize logging/tracing
    logging::init_tracing(&config.service.log_level, &config.service.environment)?;

    // Log configuration (with sensitive data masked)
    config.log_config();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting order-fanout");

    let pipeline = build_pipeline(&config).await?;

    let consumer = OrderConsumer::new(&config.trigger, &config.service, pipeline)?;
    consumer.run(shutdown_signal()).await?;

    tracing::info!("order-fanout shutdown complete");
    Ok(())
}

async fn build_pipeline(config: &Config) -> Result<OrderPipeline> {
    let topic = EventGridPublisher::new(&config.event_grid)?;
    let mut pipeline = OrderPipeline::new(Arc::new(topic));

    if config.features.document_sink {
        let pool = create_pool(&config.document_store).await?;
        run_migrations(&pool)
            .await
            .map_err(|e| Error::config(format!("Document store migration failed: {}", e)))?;

        let store = PgDocumentStore::from_config(pool, &config.document_store);
        pipeline = pipeline.with_document_sink(Arc::new(store));
    }

    if config.features.stream_sink {
        // Secrets are fetched on the first stream send, not here
        let provider = KeyVaultSecretProvider::from_env(config.stream.send_timeout())?;
        let factory = EventHubsClientFactory::new(
            config.stream.event_hub_name.clone(),
            config.stream.send_timeout(),
        );
        let credentials = CredentialCache::new(Arc::new(provider), Arc::new(factory));
        pipeline = pipeline.with_stream_sink(Arc::new(EventHubsPublisher::new(Arc::new(
            credentials,
        ))));
    }

    Ok(pipeline)
}
