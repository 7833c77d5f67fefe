//! Dead-letter records for failed invocations

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

use super::{MessagePosition, TriggerError};
use crate::error::{Error, Result};
use crate::pipeline::InvocationFailure;

/// Dead-letter message format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Message body exactly as received
    pub original_message: Vec<u8>,

    /// Error description
    pub error: String,

    /// Stable error label, e.g. `publish_error`
    pub error_type: String,

    /// Last pipeline stage that completed
    pub stage_reached: String,

    /// Present once the event had been built
    pub order_id: Option<Uuid>,

    pub timestamp: DateTime<Utc>,

    pub partition: i32,

    pub offset: i64,

    pub source_topic: String,
}

impl DeadLetter {
    pub fn new(position: &MessagePosition, body: &[u8], failure: &InvocationFailure) -> Self {
        Self {
            original_message: body.to_vec(),
            error: failure.error.to_string(),
            error_type: failure.error_type().to_string(),
            stage_reached: failure.stage_reached.to_string(),
            order_id: failure.order_id,
            timestamp: Utc::now(),
            partition: position.partition,
            offset: position.offset,
            source_topic: position.topic.clone(),
        }
    }

    pub fn key(&self) -> String {
        format!("{}-{}", self.partition, self.offset)
    }
}

/// Destination for dead letters
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send(&self, letter: &DeadLetter) -> Result<()>;
}

/// Producer for the dead-letter topic
#[derive(Clone)]
pub struct DeadLetterProducer {
    producer: FutureProducer,
    topic: String,
    send_timeout: Duration,
}

impl DeadLetterProducer {
    pub fn new(config: ClientConfig, topic: String) -> Result<Self> {
        let producer: FutureProducer = config
            .create()
            .map_err(|e| Error::from(TriggerError::Connection(e)))?;

        Ok(Self {
            producer,
            topic,
            send_timeout: Duration::from_secs(30),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Flush any pending records
    pub fn flush(&self) {
        if let Err(e) = self.producer.flush(self.send_timeout) {
            error!(topic = %self.topic, error = %e, "Dead-letter flush failed");
        }
    }
}

#[async_trait]
impl DeadLetterSink for DeadLetterProducer {
    async fn send(&self, letter: &DeadLetter) -> Result<()> {
        let payload = serde_json::to_string(letter)?;
        let key = letter.key();
        let record = FutureRecord::to(&self.topic).payload(&payload).key(&key);

        match self.producer.send(record, self.send_timeout).await {
            Ok(delivery) => {
                info!(
                    topic = %self.topic,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    error_type = %letter.error_type,
                    "Dead-lettered failed order message"
                );
                Ok(())
            },
            Err((kafka_error, _)) => {
                error!(topic = %self.topic, error = %kafka_error, "Dead-letter send failed");
                Err(TriggerError::DeadLetter(kafka_error.to_string()).into())
            },
        }
    }
}
