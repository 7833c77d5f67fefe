//! Event Grid topic publisher

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

use super::TopicSink;
use crate::config::EventGridConfig;
use crate::error::{Error, Result};
use crate::logging::Timer;
use crate::models::OrderEvent;

/// Routing subject carried by every order envelope
pub const ORDER_SUBJECT: &str = "demo/orders/new";

/// Schema version of the envelope payload
pub const DATA_VERSION: &str = "1.0";

const API_VERSION: &str = "2018-01-01";
const SAS_KEY_HEADER: &str = "aeg-sas-key";

/// Event Grid schema envelope
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventGridEvent<'a> {
    pub id: String,
    pub data: &'a OrderEvent,
    pub event_time: DateTime<Utc>,
    pub event_type: &'static str,
    pub subject: &'static str,
    pub data_version: &'static str,
}

impl<'a> EventGridEvent<'a> {
    /// Wrap an order event; the envelope id and time are taken now
    pub fn for_order(event: &'a OrderEvent) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            data: event,
            event_time: Utc::now(),
            event_type: event.severity().event_type(),
            subject: ORDER_SUBJECT,
            data_version: DATA_VERSION,
        }
    }
}

/// The Event Grid schema only accepts arrays, even for a single event
pub fn envelope_batch(event: &OrderEvent) -> [EventGridEvent<'_>; 1] {
    [EventGridEvent::for_order(event)]
}

/// Publishes order envelopes to an Event Grid topic
#[derive(Debug, Clone)]
pub struct EventGridPublisher {
    http: reqwest::Client,
    endpoint: String,
    key: String,
}

impl EventGridPublisher {
    /// Create a publisher for the configured topic
    pub fn new(config: &EventGridConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::config(format!("Failed to build Event Grid client: {}", e)))?;

        Ok(Self {
            http,
            endpoint: config.endpoint(),
            key: config.key.clone(),
        })
    }

    /// Topic endpoint events are posted to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Build the HTTP request for one batch
    pub fn build_request(&self, batch: &[EventGridEvent<'_>]) -> Result<reqwest::Request> {
        self.http
            .post(&self.endpoint)
            .header(SAS_KEY_HEADER, &self.key)
            .json(batch)
            .build()
            .map_err(|e| Error::publish(format!("Failed to build publish request: {}", e)))
    }
}

#[async_trait]
impl TopicSink for EventGridPublisher {
    async fn publish(&self, event: &OrderEvent) -> Result<()> {
        let batch = envelope_batch(event);
        let request = self.build_request(&batch)?;
        let timer = Timer::start("event_grid_publish");

        let response = self.http.execute(request).await.map_err(|e| {
            error!(order_id = %event.order_id, error = %e, "Event Grid publish failed");
            Error::publish(format!("Event Grid unreachable: {}", e))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(
                order_id = %event.order_id,
                status = %status,
                "Event Grid rejected the batch"
            );
            return Err(Error::publish(format!(
                "Event Grid answered {}: {}",
                status, body
            )));
        }

        let duration = timer.stop();
        info!(
            order_id = %event.order_id,
            event_type = batch[0].event_type,
            envelope_id = %batch[0].id,
            duration_ms = duration.as_millis(),
            "Published order event to Event Grid"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Order;
    use crate::test_utils::{ScriptedHttpServer, ScriptedResponse};
    use serde_json::Value;

    fn test_config() -> EventGridConfig {
        EventGridConfig {
            key: "sas-key".to_string(),
            topic_hostname: "orders.westus2-1.eventgrid.azure.net".to_string(),
            timeout_secs: 5,
        }
    }

    #[test]
    fn test_envelope_fields() {
        let event = OrderEvent::from_order(Order::new("ABC-1", 5));
        let json = serde_json::to_value(envelope_batch(&event)).unwrap();

        let envelopes = json.as_array().unwrap();
        assert_eq!(envelopes.len(), 1);

        let envelope = &envelopes[0];
        assert!(Uuid::parse_str(envelope["id"].as_str().unwrap()).is_ok());
        assert_eq!(envelope["eventType"], "NewOrder.Regular");
        assert_eq!(envelope["subject"], "demo/orders/new");
        assert_eq!(envelope["dataVersion"], "1.0");
        assert_eq!(envelope["data"]["orderid"], event.order_id.to_string());
        assert_eq!(envelope["data"]["sku"], "ABC-1");
        assert_eq!(envelope["data"]["quantity"], 5);

        let event_time = envelope["eventTime"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(event_time).is_ok());
    }

    #[test]
    fn test_envelope_event_type_follows_severity() {
        let large = OrderEvent::from_order(Order::new("XL-9", 5000));
        assert_eq!(EventGridEvent::for_order(&large).event_type, "NewOrder.Large");

        let boundary = OrderEvent::from_order(Order::new("B-1", 1000));
        assert_eq!(
            EventGridEvent::for_order(&boundary).event_type,
            "NewOrder.Regular"
        );
    }

    #[test]
    fn test_envelope_id_differs_from_order_id() {
        let event = OrderEvent::from_order(Order::new("ABC-1", 5));
        let envelope = EventGridEvent::for_order(&event);
        assert_ne!(envelope.id, event.order_id.to_string());
    }

    #[test]
    fn test_publish_request() {
        let publisher = EventGridPublisher::new(&test_config()).unwrap();
        let event = OrderEvent::from_order(Order::new("ABC-1", 5));
        let batch = envelope_batch(&event);

        let request = publisher.build_request(&batch).unwrap();
        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(
            request.url().as_str(),
            "https://orders.westus2-1.eventgrid.azure.net/api/events?api-version=2018-01-01"
        );
        assert_eq!(request.headers()["aeg-sas-key"], "sas-key");

        let body = request.body().and_then(|b| b.as_bytes()).unwrap();
        let json: Value = serde_json::from_slice(body).unwrap();
        assert_eq!(json.as_array().unwrap().len(), 1);
        assert_eq!(json[0]["data"]["orderid"], event.order_id.to_string());
    }

    #[tokio::test]
    async fn test_unreachable_topic_is_a_publish_error() {
        let config = EventGridConfig {
            key: "sas-key".to_string(),
            topic_hostname: "127.0.0.1:9".to_string(),
            timeout_secs: 2,
        };
        let publisher = EventGridPublisher::new(&config).unwrap();
        let event = OrderEvent::from_order(Order::new("ABC-1", 5));

        let err = publisher.publish(&event).await.unwrap_err();
        assert!(matches!(err, Error::Publish(_)));
    }

    fn local_config(server: &ScriptedHttpServer) -> EventGridConfig {
        EventGridConfig {
            key: "sas-key".to_string(),
            topic_hostname: server.base_url().to_string(),
            timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn test_publish_posts_batch_with_key() {
        let server = ScriptedHttpServer::start().await;
        server.route("POST", "/api/events", vec![ScriptedResponse::status(200)]);
        let publisher = EventGridPublisher::new(&local_config(&server)).unwrap();
        let event = OrderEvent::from_order(Order::new("ABC-1", 5));

        publisher.publish(&event).await.unwrap();

        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].headers["aeg-sas-key"], "sas-key");
        let json: Value = serde_json::from_str(&requests[0].body).unwrap();
        assert_eq!(json[0]["data"]["orderid"], event.order_id.to_string());
    }

    #[tokio::test]
    async fn test_rejected_batch_is_a_publish_error() {
        for status in [400, 401, 500] {
            let server = ScriptedHttpServer::start().await;
            server.route(
                "POST",
                "/api/events",
                vec![ScriptedResponse::status(status).text("topic said no")],
            );
            let publisher = EventGridPublisher::new(&local_config(&server)).unwrap();
            let event = OrderEvent::from_order(Order::new("ABC-1", 5));

            match publisher.publish(&event).await.unwrap_err() {
                Error::Publish(message) => {
                    assert!(message.contains(&status.to_string()), "{}", message);
                    assert!(message.contains("topic said no"), "{}", message);
                },
                other => panic!("expected a publish error, got {:?}", other),
            }
        }
    }
}
