//! order-fanout library
//!
//! Decodes order messages, turns each into an order event and fans the event
//! out to an Event Grid topic, a document store and an Event Hubs stream.

pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod sinks;
pub mod test_utils;
pub mod trigger;

// Re-export commonly used types at the crate root
pub use config::Config;
pub use error::{Error, Result};

pub use models::{decode_order, DecodeError, DecodeErrorKind, Order, OrderEvent, Severity};

pub use pipeline::{InvocationFailure, OrderPipeline, Stage};

pub use credentials::{CredentialCache, CredentialError};

pub use sinks::{DocumentSink, EventGridPublisher, EventHubsPublisher, StreamSink, TopicSink};

pub use trigger::{shutdown_signal, OrderConsumer};
