//! Downstream sinks an order event is published to
//!
//! Each sink performs exactly one outbound call per event and never calls
//! another sink. Sequencing belongs to the [`pipeline`](crate::pipeline).

pub mod stream;
pub mod topic;

pub use stream::{EventHubsClientFactory, EventHubsConnection, EventHubsPublisher, StreamSendError};
pub use topic::{EventGridEvent, EventGridPublisher};

use async_trait::async_trait;

use crate::error::Result;
use crate::models::OrderEvent;

/// Pub/sub topic sink
#[async_trait]
pub trait TopicSink: Send + Sync {
    /// Publish the event as a batch of one envelope
    async fn publish(&self, event: &OrderEvent) -> Result<()>;
}

/// Append-only document store sink
#[async_trait]
pub trait DocumentSink: Send + Sync {
    /// Append the event as a new document
    async fn add_document(&self, event: &OrderEvent) -> Result<()>;
}

/// Event stream sink
#[async_trait]
pub trait StreamSink: Send + Sync {
    /// Send the event as a single stream record
    async fn send(&self, event: &OrderEvent) -> Result<()>;
}
