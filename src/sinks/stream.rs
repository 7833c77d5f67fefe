//! Event Hubs stream publisher
//!
//! Event Hubs exposes a Kafka-compatible endpoint, so the stream client is an
//! rdkafka producer authenticated with the namespace connection string.

use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

use super::StreamSink;
use crate::credentials::{CredentialCache, CredentialError, StreamClient, StreamClientFactory};
use crate::error::Result;
use crate::logging::Timer;
use crate::models::OrderEvent;

const KAFKA_ENDPOINT_PORT: u16 = 9093;
const CONNECTION_STRING_USERNAME: &str = "$ConnectionString";

/// Stream sink failures
#[derive(Debug, Error)]
pub enum StreamSendError {
    /// The client could not be obtained from the credential cache
    #[error("stream client unavailable: {0}")]
    Credentials(#[from] CredentialError),

    /// The record was not accepted by the stream
    #[error("stream transport failure: {0}")]
    Transport(String),
}

/// Parsed Event Hubs connection string
#[derive(Clone, PartialEq, Eq)]
pub struct EventHubsConnection {
    /// Namespace host, e.g. `orders-ns.servicebus.windows.net`
    pub namespace_host: String,
    pub shared_access_key_name: String,
    pub entity_path: Option<String>,
    raw: String,
}

impl EventHubsConnection {
    /// Parse `Endpoint=sb://host/;SharedAccessKeyName=..;SharedAccessKey=..[;EntityPath=..]`
    pub fn parse(connection_string: &str) -> std::result::Result<Self, CredentialError> {
        let mut endpoint = None;
        let mut key_name = None;
        let mut key = None;
        let mut entity_path = None;

        let segments = connection_string.split(';').filter(|p| !p.trim().is_empty());
        for (position, part) in segments.enumerate() {
            let (name, value) = part.split_once('=').ok_or_else(|| {
                CredentialError::InvalidConnectionString(format!(
                    "segment {} is not a name=value pair",
                    position
                ))
            })?;
            match name.trim().to_ascii_lowercase().as_str() {
                "endpoint" => endpoint = Some(value.trim()),
                "sharedaccesskeyname" => key_name = Some(value.trim()),
                "sharedaccesskey" => key = Some(value.trim()),
                "entitypath" => entity_path = Some(value.trim()),
                _ => {},
            }
        }

        let endpoint = endpoint.ok_or_else(|| missing("Endpoint"))?;
        let namespace_host = endpoint
            .strip_prefix("sb://")
            .ok_or_else(|| {
                CredentialError::InvalidConnectionString(
                    "Endpoint must use the sb:// scheme".to_string(),
                )
            })?
            .trim_end_matches('/')
            .to_string();
        if namespace_host.is_empty() {
            return Err(missing("Endpoint host"));
        }

        let shared_access_key_name = key_name.ok_or_else(|| missing("SharedAccessKeyName"))?;
        key.filter(|k| !k.is_empty())
            .ok_or_else(|| missing("SharedAccessKey"))?;

        Ok(Self {
            namespace_host,
            shared_access_key_name: shared_access_key_name.to_string(),
            entity_path: entity_path.filter(|p| !p.is_empty()).map(str::to_string),
            raw: connection_string.trim().to_string(),
        })
    }

    /// Kafka bootstrap address for the namespace
    pub fn bootstrap_servers(&self) -> String {
        format!("{}:{}", self.namespace_host, KAFKA_ENDPOINT_PORT)
    }

    /// Producer configuration for the Kafka endpoint
    pub fn producer_config(&self, send_timeout: Duration) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", self.bootstrap_servers())
            .set("security.protocol", "SASL_SSL")
            .set("sasl.mechanism", "PLAIN")
            .set("sasl.username", CONNECTION_STRING_USERNAME)
            .set("sasl.password", &self.raw)
            .set("message.timeout.ms", send_timeout.as_millis().to_string())
            .set("acks", "all");
        config
    }
}

impl std::fmt::Debug for EventHubsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHubsConnection")
            .field("namespace_host", &self.namespace_host)
            .field("shared_access_key_name", &self.shared_access_key_name)
            .field("entity_path", &self.entity_path)
            .finish_non_exhaustive()
    }
}

fn missing(what: &str) -> CredentialError {
    CredentialError::InvalidConnectionString(format!("{} is missing", what))
}

/// Stream client backed by a Kafka producer
pub struct KafkaStreamClient {
    producer: FutureProducer,
    hub: String,
    send_timeout: Duration,
}

impl KafkaStreamClient {
    /// Event hub records are sent to
    pub fn hub(&self) -> &str {
        &self.hub
    }
}

#[async_trait]
impl StreamClient for KafkaStreamClient {
    async fn send(&self, payload: &[u8]) -> std::result::Result<(), StreamSendError> {
        let record: FutureRecord<'_, (), [u8]> = FutureRecord::to(&self.hub).payload(payload);

        match self.producer.send(record, self.send_timeout).await {
            Ok(delivery) => {
                info!(
                    hub = %self.hub,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    "Stream record delivered"
                );
                Ok(())
            },
            Err((kafka_error, _)) => Err(StreamSendError::Transport(kafka_error.to_string())),
        }
    }
}

/// Builds [`KafkaStreamClient`]s from Event Hubs connection strings
#[derive(Debug, Clone)]
pub struct EventHubsClientFactory {
    fallback_hub: Option<String>,
    send_timeout: Duration,
}

impl EventHubsClientFactory {
    /// `fallback_hub` is used when the connection string has no `EntityPath`
    pub fn new(fallback_hub: Option<String>, send_timeout: Duration) -> Self {
        Self {
            fallback_hub: fallback_hub.filter(|h| !h.trim().is_empty()),
            send_timeout,
        }
    }

    /// Hub name for a parsed connection
    pub fn resolve_hub(
        &self,
        connection: &EventHubsConnection,
    ) -> std::result::Result<String, CredentialError> {
        connection
            .entity_path
            .clone()
            .or_else(|| self.fallback_hub.clone())
            .ok_or_else(|| missing("EntityPath (and no EVENT_HUB_NAME fallback)"))
    }
}

impl StreamClientFactory for EventHubsClientFactory {
    fn build(
        &self,
        connection_string: &str,
    ) -> std::result::Result<Arc<dyn StreamClient>, CredentialError> {
        let connection = EventHubsConnection::parse(connection_string)?;
        let hub = self.resolve_hub(&connection)?;

        let producer: FutureProducer = connection
            .producer_config(self.send_timeout)
            .create()
            .map_err(|e| {
                CredentialError::InvalidConnectionString(format!("failed to create producer: {}", e))
            })?;

        info!(
            namespace = %connection.namespace_host,
            hub = %hub,
            key_name = %connection.shared_access_key_name,
            "Event Hubs producer created"
        );

        Ok(Arc::new(KafkaStreamClient {
            producer,
            hub,
            send_timeout: self.send_timeout,
        }))
    }
}

/// Stream sink that sends through the cached client
#[derive(Debug, Clone)]
pub struct EventHubsPublisher {
    credentials: Arc<CredentialCache>,
}

impl EventHubsPublisher {
    pub fn new(credentials: Arc<CredentialCache>) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl StreamSink for EventHubsPublisher {
    async fn send(&self, event: &OrderEvent) -> Result<()> {
        let client = self.credentials.stream_client().await.map_err(|e| {
            error!(order_id = %event.order_id, error = %e, "Stream client unavailable");
            StreamSendError::from(e)
        })?;

        let timer = Timer::start("event_hubs_send");
        client.send(&event.to_stream_payload()).await.map_err(|e| {
            error!(order_id = %event.order_id, error = %e, "Stream send failed");
            e
        })?;

        let duration = timer.stop();
        info!(
            order_id = %event.order_id,
            duration_ms = duration.as_millis(),
            "Sent order event to Event Hubs"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::models::Order;
    use crate::test_utils::{FakeSecretProvider, RecordingStreamClientFactory};

    const CONNECTION: &str = "Endpoint=sb://orders-ns.servicebus.windows.net/;SharedAccessKeyName=RootManageSharedAccessKey;SharedAccessKey=c2VjcmV0;EntityPath=orders";

    #[test]
    fn test_parse_connection_string() {
        let connection = EventHubsConnection::parse(CONNECTION).unwrap();
        assert_eq!(connection.namespace_host, "orders-ns.servicebus.windows.net");
        assert_eq!(connection.shared_access_key_name, "RootManageSharedAccessKey");
        assert_eq!(connection.entity_path.as_deref(), Some("orders"));
        assert_eq!(
            connection.bootstrap_servers(),
            "orders-ns.servicebus.windows.net:9093"
        );
    }

    #[test]
    fn test_parse_tolerates_trailing_separator_and_case() {
        let connection = EventHubsConnection::parse(
            "endpoint=sb://ns.servicebus.windows.net;sharedaccesskeyname=send;sharedaccesskey=abc=;",
        )
        .unwrap();
        assert_eq!(connection.namespace_host, "ns.servicebus.windows.net");
        assert!(connection.entity_path.is_none());
    }

    #[test]
    fn test_parse_rejects_incomplete_strings() {
        let cases = [
            "",
            "SharedAccessKeyName=send;SharedAccessKey=abc",
            "Endpoint=https://ns.servicebus.windows.net/;SharedAccessKeyName=send;SharedAccessKey=abc",
            "Endpoint=sb://ns.servicebus.windows.net/;SharedAccessKey=abc",
            "Endpoint=sb://ns.servicebus.windows.net/;SharedAccessKeyName=send",
            "Endpoint=sb://ns.servicebus.windows.net/;garbage",
        ];

        for case in cases {
            let err = EventHubsConnection::parse(case).unwrap_err();
            assert!(
                matches!(err, CredentialError::InvalidConnectionString(_)),
                "{}",
                case
            );
        }
    }

    #[test]
    fn test_parse_errors_do_not_leak_key() {
        let err = EventHubsConnection::parse("Endpoint=sb://ns/;SharedAccessKeyName=send;topsecret")
            .unwrap_err();
        assert!(!err.to_string().contains("topsecret"));

        let err = EventHubsConnection::parse("Endpoint=ftp://ns/;SharedAccessKeyName=send;SharedAccessKey=hunter2")
            .unwrap_err();
        assert!(!err.to_string().contains("hunter2"));
    }

    #[test]
    fn test_producer_config() {
        let connection = EventHubsConnection::parse(CONNECTION).unwrap();
        let config = connection.producer_config(Duration::from_secs(30));

        assert_eq!(
            config.get("bootstrap.servers"),
            Some("orders-ns.servicebus.windows.net:9093")
        );
        assert_eq!(config.get("security.protocol"), Some("SASL_SSL"));
        assert_eq!(config.get("sasl.mechanism"), Some("PLAIN"));
        assert_eq!(config.get("sasl.username"), Some("$ConnectionString"));
        assert_eq!(config.get("sasl.password"), Some(CONNECTION));
        assert_eq!(config.get("message.timeout.ms"), Some("30000"));
    }

    #[test]
    fn test_hub_resolution() {
        let with_path = EventHubsConnection::parse(CONNECTION).unwrap();
        let without_path = EventHubsConnection::parse(
            "Endpoint=sb://ns.servicebus.windows.net/;SharedAccessKeyName=send;SharedAccessKey=abc",
        )
        .unwrap();

        let factory = EventHubsClientFactory::new(Some("fallback".to_string()), Duration::from_secs(5));
        assert_eq!(factory.resolve_hub(&with_path).unwrap(), "orders");
        assert_eq!(factory.resolve_hub(&without_path).unwrap(), "fallback");

        let factory = EventHubsClientFactory::new(None, Duration::from_secs(5));
        assert!(factory.resolve_hub(&without_path).is_err());
    }

    #[tokio::test]
    async fn test_publisher_sends_text_payload() {
        let factory = RecordingStreamClientFactory::new();
        let cache = CredentialCache::new(
            Arc::new(FakeSecretProvider::returning(CONNECTION)),
            Arc::new(factory.clone()),
        );
        let publisher = EventHubsPublisher::new(Arc::new(cache));
        let event = OrderEvent::from_order(Order::new("ABC-1", 5));

        publisher.send(&event).await.unwrap();

        let sent = factory.sent_payloads();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], event.to_string());
    }

    #[tokio::test]
    async fn test_credential_failure_becomes_stream_send_error() {
        let cache = CredentialCache::new(
            Arc::new(FakeSecretProvider::failing(CredentialError::ConfigMissing(
                "VaultUrl".to_string(),
            ))),
            Arc::new(RecordingStreamClientFactory::new()),
        );
        let publisher = EventHubsPublisher::new(Arc::new(cache));
        let event = OrderEvent::from_order(Order::new("ABC-1", 5));

        let err = publisher.send(&event).await.unwrap_err();
        assert!(matches!(
            err,
            Error::StreamSend(StreamSendError::Credentials(CredentialError::ConfigMissing(_)))
        ));
    }

    #[tokio::test]
    async fn test_transport_failure_is_reported() {
        let factory = RecordingStreamClientFactory::new();
        factory.fail_sends("broker unavailable");
        let cache = CredentialCache::new(
            Arc::new(FakeSecretProvider::returning(CONNECTION)),
            Arc::new(factory.clone()),
        );
        let publisher = EventHubsPublisher::new(Arc::new(cache));
        let event = OrderEvent::from_order(Order::new("ABC-1", 5));

        let err = publisher.send(&event).await.unwrap_err();
        assert!(matches!(err, Error::StreamSend(StreamSendError::Transport(_))));
    }
}
