//! Order fan-out orchestrator
//!
//! One invocation per inbound message:
//!
//! ```text
//! Received -> Decoded -> EventBuilt -> PublishedTopic -> PublishedStore -> PublishedStream -> Complete
//! ```
//!
//! Steps run strictly in that order and the first failure ends the
//! invocation. Sinks that already succeeded are not compensated. A sink that
//! is not configured is skipped without changing the order of the others.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{decode_order, OrderEvent};
use crate::sinks::{DocumentSink, StreamSink, TopicSink};

/// Furthest point an invocation reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Received,
    Decoded,
    EventBuilt,
    PublishedTopic,
    PublishedStore,
    PublishedStream,
    Complete,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::Decoded => "decoded",
            Stage::EventBuilt => "event_built",
            Stage::PublishedTopic => "published_topic",
            Stage::PublishedStore => "published_store",
            Stage::PublishedStream => "published_stream",
            Stage::Complete => "complete",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A failed invocation and how far it got
#[derive(Debug, Error)]
#[error("invocation failed after stage '{stage_reached}': {error}")]
pub struct InvocationFailure {
    /// Last stage that completed before the failure
    pub stage_reached: Stage,
    /// Set once the event was built
    pub order_id: Option<Uuid>,
    #[source]
    pub error: Error,
}

impl InvocationFailure {
    /// Stable label of the underlying error
    pub fn error_type(&self) -> &'static str {
        self.error.error_type()
    }
}

/// Progress tracked outside the invocation future so it survives cancellation
#[derive(Debug)]
struct Progress {
    stage: Stage,
    order_id: Option<Uuid>,
}

impl Progress {
    fn new() -> Self {
        Self {
            stage: Stage::Received,
            order_id: None,
        }
    }

    fn advance(&mut self, stage: Stage) {
        self.stage = stage;
        tracing::Span::current().record("stage", stage.as_str());
    }

    fn fail(self, error: Error) -> InvocationFailure {
        InvocationFailure {
            stage_reached: self.stage,
            order_id: self.order_id,
            error,
        }
    }
}

/// Sequences decode, build and the configured sinks
#[derive(Clone)]
pub struct OrderPipeline {
    topic: Arc<dyn TopicSink>,
    store: Option<Arc<dyn DocumentSink>>,
    stream: Option<Arc<dyn StreamSink>>,
}

impl OrderPipeline {
    /// Topic-only pipeline
    pub fn new(topic: Arc<dyn TopicSink>) -> Self {
        Self {
            topic,
            store: None,
            stream: None,
        }
    }

    /// Append every event to a document store after the topic publish
    pub fn with_document_sink(mut self, store: Arc<dyn DocumentSink>) -> Self {
        self.store = Some(store);
        self
    }

    /// Send every event to the stream after the document store
    pub fn with_stream_sink(mut self, stream: Arc<dyn StreamSink>) -> Self {
        self.stream = Some(stream);
        self
    }

    /// Names of the configured sinks, in dispatch order
    pub fn sink_names(&self) -> Vec<&'static str> {
        let mut names = vec!["topic"];
        if self.store.is_some() {
            names.push("document_store");
        }
        if self.stream.is_some() {
            names.push("stream");
        }
        names
    }

    /// Run one invocation with no deadline
    pub async fn process(&self, body: &[u8]) -> std::result::Result<OrderEvent, InvocationFailure> {
        let mut progress = Progress::new();
        match self.run(body, &mut progress).await {
            Ok(event) => Ok(event),
            Err(error) => Err(self.report(progress.fail(error))),
        }
    }

    /// Run one invocation, abandoning the in-flight call when the deadline passes
    pub async fn process_with_deadline(
        &self,
        body: &[u8],
        deadline: Duration,
    ) -> std::result::Result<OrderEvent, InvocationFailure> {
        let mut progress = Progress::new();
        let outcome = tokio::time::timeout(deadline, self.run(body, &mut progress)).await;

        match outcome {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(error)) => Err(self.report(progress.fail(error))),
            Err(_) => {
                let error = Error::Timeout(format!(
                    "invocation exceeded {}ms",
                    deadline.as_millis()
                ));
                Err(self.report(progress.fail(error)))
            },
        }
    }

    async fn run(&self, body: &[u8], progress: &mut Progress) -> Result<OrderEvent> {
        let order = decode_order(body)?;
        progress.advance(Stage::Decoded);
        info!(sku = %order.sku, quantity = order.quantity, "Order received");

        let event = OrderEvent::from_order(order);
        progress.order_id = Some(event.order_id);
        progress.advance(Stage::EventBuilt);

        let severity = event.severity();
        let span = tracing::Span::current();
        span.record("order_id", tracing::field::display(event.order_id));
        span.record("event_type", severity.event_type());
        debug!(order_id = %event.order_id, severity = %severity, "Order event built");

        self.topic.publish(&event).await?;
        progress.advance(Stage::PublishedTopic);

        if let Some(store) = &self.store {
            store.add_document(&event).await?;
            progress.advance(Stage::PublishedStore);
        }

        if let Some(stream) = &self.stream {
            stream.send(&event).await?;
            progress.advance(Stage::PublishedStream);
        }

        progress.advance(Stage::Complete);
        info!(
            order_id = %event.order_id,
            sinks = ?self.sink_names(),
            "Order fanned out"
        );
        Ok(event)
    }

    fn report(&self, failure: InvocationFailure) -> InvocationFailure {
        warn!(
            stage_reached = %failure.stage_reached,
            order_id = ?failure.order_id,
            error_type = failure.error_type(),
            sink_failure = failure.error.is_sink_failure(),
            error = %failure.error,
            "Invocation failed"
        );
        failure
    }
}

impl fmt::Debug for OrderPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderPipeline")
            .field("sinks", &self.sink_names())
            .finish()
    }
}
