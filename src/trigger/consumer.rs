//! Kafka order consumer with manual offset management

use anyhow::anyhow;
use futures::stream::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Message, OwnedMessage};
use rdkafka::topic_partition_list::TopicPartitionList;
use rdkafka::Offset;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn, Instrument};

use super::{DeadLetter, DeadLetterProducer, DeadLetterSink, MessagePosition, OffsetTracker};
use crate::config::{ServiceConfig, TriggerConfig};
use crate::error::Result;
use crate::pipeline::OrderPipeline;

/// What happened to one inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Every configured sink accepted the event
    Completed,
    /// The invocation failed and the message was dead-lettered
    DeadLettered,
    /// The invocation failed and so did the dead-letter send
    DeadLetterFailed,
}

impl Disposition {
    /// Whether the message may be committed past
    ///
    /// A message that reached neither a sink nor the dead-letter topic is left
    /// uncommitted so it comes back after a restart or rebalance.
    pub fn releases_offset(self) -> bool {
        !matches!(self, Disposition::DeadLetterFailed)
    }
}

/// Record a finished message and return the offset to commit, if any
pub fn settle(
    tracker: &mut OffsetTracker,
    position: &MessagePosition,
    disposition: Disposition,
) -> Option<i64> {
    if disposition.releases_offset() {
        return tracker.finish(position.partition, position.offset);
    }

    warn!(
        partition = position.partition,
        offset = position.offset,
        held = tracker.held() + 1,
        "Holding offset uncommitted for redelivery"
    );
    tracker.hold(position.partition, position.offset)
}

/// Run one invocation and dead-letter it on failure
pub async fn handle_message(
    pipeline: &OrderPipeline,
    dead_letters: &dyn DeadLetterSink,
    position: &MessagePosition,
    body: &[u8],
    deadline: Duration,
) -> Disposition {
    match pipeline.process_with_deadline(body, deadline).await {
        Ok(event) => {
            debug!(
                partition = position.partition,
                offset = position.offset,
                order_id = %event.order_id,
                "Message processed"
            );
            Disposition::Completed
        },
        Err(failure) => {
            let letter = DeadLetter::new(position, body, &failure);
            match dead_letters.send(&letter).await {
                Ok(()) => Disposition::DeadLettered,
                Err(e) => {
                    error!(
                        partition = position.partition,
                        offset = position.offset,
                        error = %e,
                        "Failed to dead-letter message"
                    );
                    Disposition::DeadLetterFailed
                },
            }
        },
    }
}

/// Consumes order messages and runs the pipeline for each one
pub struct OrderConsumer {
    consumer: Arc<StreamConsumer>,
    pipeline: OrderPipeline,
    dead_letters: DeadLetterProducer,
    topic: String,
    deadline: Duration,
    max_in_flight: usize,
    semaphore: Arc<Semaphore>,
    offsets: Arc<Mutex<OffsetTracker>>,
}

impl OrderConsumer {
    /// Create a consumer subscribed to the orders topic
    pub fn new(
        trigger: &TriggerConfig,
        service: &ServiceConfig,
        pipeline: OrderPipeline,
    ) -> Result<Self> {
        // Create consumer with manual commits
        let consumer: StreamConsumer = trigger
            .build_consumer_config()
            .create()
            .map_err(|e| anyhow!("Failed to create Kafka consumer: {}", e))?;

        // Subscribe to orders topic
        consumer
            .subscribe(&[&trigger.orders_topic])
            .map_err(|e| anyhow!("Failed to subscribe to topic: {}", e))?;

        // Create DLQ producer
        let dead_letters =
            DeadLetterProducer::new(trigger.build_producer_config(), trigger.dlq_topic.clone())?;

        // Bound concurrent invocations
        let max_in_flight = service.max_concurrent_invocations.max(1);

        Ok(Self {
            consumer: Arc::new(consumer),
            pipeline,
            dead_letters,
            topic: trigger.orders_topic.clone(),
            deadline: service.invocation_timeout(),
            max_in_flight,
            semaphore: Arc::new(Semaphore::new(max_in_flight)),
            offsets: Arc::new(Mutex::new(OffsetTracker::new())),
        })
    }

    /// Consume until `shutdown` resolves, then drain in-flight invocations
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(
            topic = %self.topic,
            max_in_flight = self.max_in_flight,
            sinks = ?self.pipeline.sink_names(),
            "Starting order consumer"
        );

        let consumer = Arc::clone(&self.consumer);
        let stream = consumer.stream();
        tokio::pin!(stream);
        tokio::pin!(shutdown);

        loop {
            let next = tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer polling");
                    break;
                }
                message = stream.next() => message,
            };

            // Detach so the message outlives the stream borrow
            let message = match next {
                Some(Ok(message)) => message.detach(),
                Some(Err(e)) => {
                    error!(error = %e, "Kafka consumer error");
                    continue;
                },
                None => break,
            };

            // Wait for a free invocation slot
            let permit = Arc::clone(&self.semaphore)
                .acquire_owned()
                .await
                .map_err(|e| anyhow!("Failed to acquire semaphore: {}", e))?;

            self.dispatch(message, permit);
        }

        self.drain().await
    }

    fn dispatch(&self, message: OwnedMessage, permit: OwnedSemaphorePermit) {
        let position = MessagePosition::new(message.topic(), message.partition(), message.offset());
        let body = message.payload().map(<[u8]>::to_vec).unwrap_or_default();

        // Track before spawning so the watermark cannot pass it
        lock(&self.offsets).start(position.partition, position.offset);

        let consumer = Arc::clone(&self.consumer);
        let offsets = Arc::clone(&self.offsets);
        let pipeline = self.pipeline.clone();
        let dead_letters = self.dead_letters.clone();
        let deadline = self.deadline;

        tokio::spawn(async move {
            let span = crate::invocation_span!(position.partition, position.offset);
            let disposition =
                handle_message(&pipeline, &dead_letters, &position, &body, deadline)
                    .instrument(span)
                    .await;

            // Commit under the lock so watermarks reach the broker in order
            let mut tracker = lock(&offsets);
            if let Some(next) = settle(&mut tracker, &position, disposition) {
                commit(&consumer, &position.topic, position.partition, next);
            }
            drop(tracker);
            drop(permit);
        });
    }

    async fn drain(&self) -> Result<()> {
        let in_flight = self.max_in_flight - self.semaphore.available_permits();
        if in_flight > 0 {
            info!(in_flight, "Waiting for in-flight invocations");
        }

        // Every permit back means every spawned invocation has finished
        let _all = self
            .semaphore
            .acquire_many(self.max_in_flight as u32)
            .await
            .map_err(|e| anyhow!("Failed to drain invocations: {}", e))?;

        // Push out queued dead letters
        self.dead_letters.flush();

        let held = lock(&self.offsets).held();
        if held > 0 {
            warn!(held, "Stopping with uncommitted offsets left for redelivery");
        }
        info!("Order consumer stopped");
        Ok(())
    }
}

fn lock(offsets: &Mutex<OffsetTracker>) -> std::sync::MutexGuard<'_, OffsetTracker> {
    offsets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn commit(consumer: &StreamConsumer, topic: &str, partition: i32, next: i64) {
    let mut offsets = TopicPartitionList::new();
    if let Err(e) = offsets.add_partition_offset(topic, partition, Offset::Offset(next)) {
        warn!(partition, offset = next, error = %e, "Failed to track offset");
        return;
    }
    if let Err(e) = consumer.commit(&offsets, CommitMode::Async) {
        warn!(partition, offset = next, error = %e, "Failed to commit offset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        order_body, CallLog, RecordingDeadLetterSink, RecordingDocumentSink, RecordingTopicSink,
    };

    fn trigger_config() -> TriggerConfig {
        TriggerConfig {
            brokers: "localhost:9092".to_string(),
            consumer_group: "order-fanout-test".to_string(),
            orders_topic: "orders".to_string(),
            dlq_topic: "orders-dlq".to_string(),
            session_timeout_ms: 30000,
        }
    }

    fn service_config() -> ServiceConfig {
        ServiceConfig {
            log_level: "debug".to_string(),
            environment: "test".to_string(),
            invocation_timeout_secs: 5,
            max_concurrent_invocations: 4,
        }
    }

    #[tokio::test]
    async fn test_success_is_not_dead_lettered() {
        let topic = RecordingTopicSink::new(CallLog::new());
        let pipeline = OrderPipeline::new(Arc::new(topic.clone()));
        let dead_letters = RecordingDeadLetterSink::new();
        let position = MessagePosition::new("orders", 0, 1);

        let disposition = handle_message(
            &pipeline,
            &dead_letters,
            &position,
            &order_body("ABC-1", 5),
            Duration::from_secs(5),
        )
        .await;

        assert_eq!(disposition, Disposition::Completed);
        assert!(dead_letters.letters().is_empty());
        assert_eq!(topic.batches().len(), 1);
    }

    #[tokio::test]
    async fn test_decode_failure_is_dead_lettered() {
        let pipeline = OrderPipeline::new(Arc::new(RecordingTopicSink::new(CallLog::new())));
        let dead_letters = RecordingDeadLetterSink::new();
        let position = MessagePosition::new("orders", 1, 9);

        let disposition = handle_message(
            &pipeline,
            &dead_letters,
            &position,
            b"not json",
            Duration::from_secs(5),
        )
        .await;

        assert_eq!(disposition, Disposition::DeadLettered);
        let letters = dead_letters.letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].error_type, "decode_error");
        assert_eq!(letters[0].stage_reached, "received");
        assert_eq!(letters[0].original_message, b"not json".to_vec());
        assert_eq!(letters[0].offset, 9);
    }

    #[tokio::test]
    async fn test_sink_failure_records_stage_and_order_id() {
        let log = CallLog::new();
        let store = RecordingDocumentSink::new(log.clone());
        store.fail_with("collection offline");
        let pipeline = OrderPipeline::new(Arc::new(RecordingTopicSink::new(log)))
            .with_document_sink(Arc::new(store));
        let dead_letters = RecordingDeadLetterSink::new();
        let position = MessagePosition::new("orders", 0, 2);

        handle_message(
            &pipeline,
            &dead_letters,
            &position,
            &order_body("ABC-1", 5),
            Duration::from_secs(5),
        )
        .await;

        let letters = dead_letters.letters();
        assert_eq!(letters[0].error_type, "store_write_error");
        assert_eq!(letters[0].stage_reached, "published_topic");
        assert!(letters[0].order_id.is_some());
    }

    #[tokio::test]
    async fn test_dead_letter_failure_is_reported() {
        let pipeline = OrderPipeline::new(Arc::new(RecordingTopicSink::new(CallLog::new())));
        let dead_letters = RecordingDeadLetterSink::new();
        dead_letters.fail_with("dlq unavailable");
        let position = MessagePosition::new("orders", 0, 3);

        let disposition = handle_message(
            &pipeline,
            &dead_letters,
            &position,
            b"{}",
            Duration::from_secs(5),
        )
        .await;

        assert_eq!(disposition, Disposition::DeadLetterFailed);
        assert!(!disposition.releases_offset());
    }

    #[test]
    fn test_lost_message_is_never_committed_past() {
        let mut tracker = OffsetTracker::new();
        let lost = MessagePosition::new("orders", 0, 40);
        let later = MessagePosition::new("orders", 0, 41);
        tracker.start(0, 40);
        tracker.start(0, 41);

        assert_eq!(settle(&mut tracker, &later, Disposition::Completed), Some(40));
        assert_eq!(settle(&mut tracker, &lost, Disposition::DeadLetterFailed), None);

        let next = MessagePosition::new("orders", 0, 42);
        tracker.start(0, 42);
        assert_eq!(settle(&mut tracker, &next, Disposition::DeadLettered), None);
        assert_eq!(tracker.held(), 1);
    }

    #[test]
    fn test_dead_lettered_message_is_committed() {
        let mut tracker = OffsetTracker::new();
        let position = MessagePosition::new("orders", 2, 7);
        tracker.start(2, 7);

        assert_eq!(settle(&mut tracker, &position, Disposition::DeadLettered), Some(8));
        assert_eq!(tracker.held(), 0);
    }

    #[tokio::test]
    async fn test_consumer_creation() {
        let pipeline = OrderPipeline::new(Arc::new(RecordingTopicSink::new(CallLog::new())));
        let consumer = OrderConsumer::new(&trigger_config(), &service_config(), pipeline).unwrap();

        assert_eq!(consumer.max_in_flight, 4);
        assert_eq!(consumer.deadline, Duration::from_secs(5));
        assert_eq!(consumer.semaphore.available_permits(), 4);
    }

    #[tokio::test]
    async fn test_immediate_shutdown_drains_cleanly() {
        let pipeline = OrderPipeline::new(Arc::new(RecordingTopicSink::new(CallLog::new())));
        let consumer = OrderConsumer::new(&trigger_config(), &service_config(), pipeline).unwrap();

        consumer.run(async {}).await.unwrap();
    }
}
