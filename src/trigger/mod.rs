//! Kafka trigger host for the order pipeline
//!
//! This module provides:
//! - The order consumer with manual, in-order offset commits
//! - The dead-letter producer for failed invocations
//! - Graceful shutdown that drains in-flight invocations

mod consumer;
mod dead_letter;
mod offsets;

pub use consumer::{handle_message, settle, Disposition, OrderConsumer};
pub use dead_letter::{DeadLetter, DeadLetterProducer, DeadLetterSink};
pub use offsets::OffsetTracker;

use rdkafka::error::KafkaError;
use thiserror::Error;

/// Trigger-specific error types
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("Kafka connection error: {0}")]
    Connection(#[from] KafkaError),

    #[error("Dead-letter send failed: {0}")]
    DeadLetter(String),

    #[error("Offset commit failed: {0}")]
    Commit(String),
}

impl From<TriggerError> for crate::error::Error {
    fn from(err: TriggerError) -> Self {
        crate::error::Error::internal(err.to_string())
    }
}

/// Where a message was read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePosition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl MessagePosition {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }
}

/// Resolve on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received CTRL+C, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
