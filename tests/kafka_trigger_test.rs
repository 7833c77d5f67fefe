//! Integration tests for the Kafka trigger
//!
//! Need a broker on localhost:9092, so they are ignored by default.

use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use order_fanout::config::{ServiceConfig, TriggerConfig};
use order_fanout::pipeline::OrderPipeline;
use order_fanout::test_utils::{order_body, CallLog, RecordingTopicSink};
use order_fanout::trigger::{DeadLetter, OrderConsumer};

const TEST_KAFKA_BROKER: &str = "localhost:9092";

async fn create_test_topics(topic: &str, dlq_topic: &str) {
    let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
        .set("bootstrap.servers", TEST_KAFKA_BROKER)
        .create()
        .expect("Failed to create admin client");

    let topics = [
        NewTopic::new(topic, 1, TopicReplication::Fixed(1)),
        NewTopic::new(dlq_topic, 1, TopicReplication::Fixed(1)),
    ];

    admin
        .create_topics(&topics, &AdminOptions::new())
        .await
        .expect("Failed to create topics");
}

fn configs(topic: &str, dlq_topic: &str) -> (TriggerConfig, ServiceConfig) {
    let trigger = TriggerConfig {
        brokers: TEST_KAFKA_BROKER.to_string(),
        consumer_group: format!("order-fanout-test-{}", Uuid::new_v4()),
        orders_topic: topic.to_string(),
        dlq_topic: dlq_topic.to_string(),
        session_timeout_ms: 10000,
    };
    let service = ServiceConfig {
        log_level: "debug".to_string(),
        environment: "test".to_string(),
        invocation_timeout_secs: 10,
        max_concurrent_invocations: 4,
    };
    (trigger, service)
}

async fn produce(topic: &str, bodies: &[Vec<u8>]) {
    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", TEST_KAFKA_BROKER)
        .create()
        .expect("Failed to create producer");

    for body in bodies {
        producer
            .send(FutureRecord::<(), _>::to(topic).payload(body), Duration::from_secs(5))
            .await
            .expect("Failed to produce");
    }
}

#[tokio::test]
#[ignore = "requires a Kafka broker"]
async fn test_orders_are_fanned_out_and_failures_dead_lettered() {
    let suffix = Uuid::new_v4();
    let topic = format!("orders-{}", suffix);
    let dlq_topic = format!("orders-dlq-{}", suffix);
    create_test_topics(&topic, &dlq_topic).await;

    produce(
        &topic,
        &[order_body("KAFKA-1", 5), b"not json".to_vec(), order_body("KAFKA-2", 5000)],
    )
    .await;

    let topic_sink = RecordingTopicSink::new(CallLog::new());
    let pipeline = OrderPipeline::new(Arc::new(topic_sink.clone()));
    let (trigger, service) = configs(&topic, &dlq_topic);
    let consumer = OrderConsumer::new(&trigger, &service, pipeline).unwrap();

    let watched = topic_sink.clone();
    consumer
        .run(async move {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
            while watched.batches().len() < 2 && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            // Leave time for the failed message's dead letter
            tokio::time::sleep(Duration::from_secs(2)).await;
        })
        .await
        .unwrap();

    assert_eq!(topic_sink.batches().len(), 2);

    let dlq_consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", TEST_KAFKA_BROKER)
        .set("group.id", format!("dlq-reader-{}", suffix))
        .set("auto.offset.reset", "earliest")
        .create()
        .unwrap();
    dlq_consumer.subscribe(&[&dlq_topic]).unwrap();

    let message = tokio::time::timeout(Duration::from_secs(30), dlq_consumer.recv())
        .await
        .expect("No dead letter received")
        .unwrap();
    let letter: DeadLetter = serde_json::from_slice(message.payload().unwrap()).unwrap();

    assert_eq!(letter.original_message, b"not json".to_vec());
    assert_eq!(letter.error_type, "decode_error");
    assert_eq!(letter.source_topic, topic);
}
