//! Configuration module for order-fanout
//!
//! Startup settings are loaded from environment variables (and a `.env` file
//! for local runs). The vault settings used by the credential cache are not
//! part of this struct: they are read on first stream publish.

use envconfig::Envconfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// Main configuration structure for order-fanout
#[derive(Debug, Clone, Deserialize, Serialize, Envconfig)]
pub struct Config {
    #[serde(flatten)]
    #[envconfig(nested)]
    pub service: ServiceConfig,

    #[serde(flatten)]
    #[envconfig(nested)]
    pub event_grid: EventGridConfig,

    #[serde(flatten)]
    #[envconfig(nested)]
    pub trigger: TriggerConfig,

    #[serde(flatten)]
    #[envconfig(nested)]
    pub document_store: DocumentStoreConfig,

    #[serde(flatten)]
    #[envconfig(nested)]
    pub stream: StreamConfig,

    #[serde(flatten)]
    #[envconfig(nested)]
    pub features: FeatureFlags,
}

/// Process-level settings
#[derive(Debug, Clone, Deserialize, Serialize, Envconfig)]
pub struct ServiceConfig {
    /// Log level
    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,

    /// Environment (development, staging, production)
    #[envconfig(from = "ENVIRONMENT", default = "development")]
    pub environment: String,

    /// Deadline for a single invocation
    #[envconfig(from = "INVOCATION_TIMEOUT_SECS", default = "230")]
    pub invocation_timeout_secs: u64,

    /// Upper bound on invocations running at once
    #[envconfig(from = "MAX_CONCURRENT_INVOCATIONS", default = "16")]
    pub max_concurrent_invocations: usize,
}

impl ServiceConfig {
    /// Get the invocation deadline as Duration
    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_secs(self.invocation_timeout_secs)
    }
}

/// Event Grid topic settings
#[derive(Clone, Deserialize, Serialize, Envconfig)]
pub struct EventGridConfig {
    /// Topic access key
    #[envconfig(from = "EventGridKey")]
    pub key: String,

    /// Topic hostname, e.g. `orders.westus2-1.eventgrid.azure.net`
    #[envconfig(from = "EventGridTopicHostname")]
    pub topic_hostname: String,

    /// HTTP timeout for a publish call
    #[envconfig(from = "EVENT_GRID_TIMEOUT_SECS", default = "30")]
    pub timeout_secs: u64,
}

impl EventGridConfig {
    /// Publish endpoint for the topic
    ///
    /// HTTPS unless the hostname explicitly asks for `http://`, as local
    /// emulators do.
    pub fn endpoint(&self) -> String {
        let hostname = self.topic_hostname.trim();
        let (scheme, host) = match hostname.strip_prefix("http://") {
            Some(host) => ("http", host),
            None => ("https", hostname.trim_start_matches("https://")),
        };
        let host = host.trim_end_matches('/');
        let host = host.strip_suffix("/api/events").unwrap_or(host);
        format!("{}://{}/api/events?api-version=2018-01-01", scheme, host)
    }
}

impl std::fmt::Debug for EventGridConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventGridConfig")
            .field("key", &"***")
            .field("topic_hostname", &self.topic_hostname)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

/// Inbound queue (Kafka) settings
#[derive(Debug, Clone, Deserialize, Serialize, Envconfig)]
pub struct TriggerConfig {
    /// Kafka brokers (comma-separated)
    #[envconfig(from = "KAFKA_BROKERS", default = "localhost:9092")]
    pub brokers: String,

    /// Consumer group ID
    #[envconfig(from = "KAFKA_CONSUMER_GROUP", default = "order-fanout")]
    pub consumer_group: String,

    /// Topic order messages arrive on
    #[envconfig(from = "ORDERS_TOPIC", default = "orders")]
    pub orders_topic: String,

    /// Topic failed messages are dead-lettered to
    #[envconfig(from = "ORDERS_DLQ_TOPIC", default = "orders-dlq")]
    pub dlq_topic: String,

    /// Session timeout in milliseconds
    #[envconfig(from = "KAFKA_SESSION_TIMEOUT_MS", default = "30000")]
    pub session_timeout_ms: u32,
}

impl TriggerConfig {
    /// Get brokers as a vector
    pub fn brokers_list(&self) -> Vec<String> {
        self.brokers.split(',').map(|s| s.trim().to_string()).collect()
    }

    /// Build rdkafka consumer configuration
    pub fn build_consumer_config(&self) -> rdkafka::ClientConfig {
        let mut config = rdkafka::ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.consumer_group)
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", self.session_timeout_ms.to_string())
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", "earliest");
        config
    }

    /// Build rdkafka producer configuration for the dead-letter topic
    pub fn build_producer_config(&self) -> rdkafka::ClientConfig {
        let mut config = rdkafka::ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("message.timeout.ms", "30000")
            .set("acks", "all");
        config
    }
}

/// Document store settings
#[derive(Debug, Clone, Deserialize, Serialize, Envconfig)]
pub struct DocumentStoreConfig {
    /// PostgreSQL connection URL
    #[envconfig(from = "DocumentStoreConnectionString", default = "")]
    pub url: String,

    /// Logical database documents are filed under
    #[envconfig(from = "DOCUMENT_DATABASE", default = "ordersDatabase")]
    pub database: String,

    /// Collection documents are appended to
    #[envconfig(from = "DOCUMENT_COLLECTION", default = "ordersCollection")]
    pub collection: String,

    /// Maximum pool size
    #[envconfig(from = "DATABASE_POOL_MAX_SIZE", default = "10")]
    pub pool_max_size: u32,

    /// Pool timeout in seconds
    #[envconfig(from = "DATABASE_POOL_TIMEOUT_SECONDS", default = "30")]
    pub pool_timeout_seconds: u64,
}

impl DocumentStoreConfig {
    /// Get pool timeout as Duration
    pub fn pool_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_timeout_seconds)
    }

    /// Mask password in URL for logging
    pub fn masked_url(&self) -> String {
        if let Some(at_pos) = self.url.find('@') {
            if let Some(scheme_end) = self.url.find("://") {
                let start = &self.url[..scheme_end + 3];
                let end = &self.url[at_pos..];
                return format!("{}***{}", start, end);
            }
        }
        "***".to_string()
    }
}

/// Event stream settings
#[derive(Debug, Clone, Deserialize, Serialize, Envconfig)]
pub struct StreamConfig {
    /// Hub used when the connection string carries no EntityPath
    #[envconfig(from = "EVENT_HUB_NAME")]
    pub event_hub_name: Option<String>,

    /// Delivery timeout for a single record
    #[envconfig(from = "STREAM_SEND_TIMEOUT_SECS", default = "30")]
    pub send_timeout_secs: u64,
}

impl StreamConfig {
    /// Get send timeout as Duration
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}

/// Which sinks run after the topic publish
#[derive(Debug, Clone, Deserialize, Serialize, Envconfig)]
pub struct FeatureFlags {
    /// Append events to the document store
    #[envconfig(from = "ENABLE_DOCUMENT_SINK", default = "true")]
    pub document_sink: bool,

    /// Send events to the event stream
    #[envconfig(from = "ENABLE_STREAM_SINK", default = "true")]
    pub stream_sink: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists (for local development)
        dotenv::dotenv().ok();

        Config::init_from_env().map_err(Error::from)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.event_grid.key.trim().is_empty() {
            return Err(Error::config("EventGridKey cannot be empty"));
        }

        if self.event_grid.topic_hostname.trim().is_empty() {
            return Err(Error::config("EventGridTopicHostname cannot be empty"));
        }

        if self.trigger.brokers.trim().is_empty() {
            return Err(Error::config("Kafka brokers cannot be empty"));
        }

        if self.trigger.orders_topic == self.trigger.dlq_topic {
            return Err(Error::config(
                "Orders topic and dead-letter topic must differ",
            ));
        }

        if self.features.document_sink && self.document_store.url.trim().is_empty() {
            return Err(Error::config(
                "DocumentStoreConnectionString is required when the document sink is enabled",
            ));
        }

        if self.service.max_concurrent_invocations == 0 {
            return Err(Error::config("Invocation concurrency must be at least 1"));
        }

        if self.service.invocation_timeout_secs == 0 {
            return Err(Error::config("Invocation timeout must be at least 1 second"));
        }

        Ok(())
    }

    /// Log configuration (with sensitive data masked)
    pub fn log_config(&self) {
        tracing::info!(
            environment = %self.service.environment,
            log_level = %self.service.log_level,
            invocation_timeout_secs = self.service.invocation_timeout_secs,
            max_concurrent_invocations = self.service.max_concurrent_invocations,
            "Service configuration"
        );

        tracing::info!(
            endpoint = %self.event_grid.endpoint(),
            "Event Grid configuration"
        );

        tracing::info!(
            brokers = ?self.trigger.brokers_list(),
            group_id = %self.trigger.consumer_group,
            orders_topic = %self.trigger.orders_topic,
            dlq_topic = %self.trigger.dlq_topic,
            "Trigger configuration"
        );

        if self.features.document_sink {
            tracing::info!(
                url = %self.document_store.masked_url(),
                database = %self.document_store.database,
                collection = %self.document_store.collection,
                "Document store configuration"
            );
        }

        tracing::info!(
            document_sink = self.features.document_sink,
            stream_sink = self.features.stream_sink,
            "Enabled sinks"
        );
    }
}
