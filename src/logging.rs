//! Logging module for order-fanout
//!
//! Structured logging through `tracing`: JSON output in production, pretty
//! output everywhere else.

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

use crate::error::{Error, Result};

/// Initialize the logging system
///
/// `RUST_LOG` wins when set; otherwise the crate logs at `log_level` and
/// rdkafka/sqlx stay at `warn`.
pub fn init_tracing(log_level: &str, environment: &str) -> Result<()> {
    // Create environment filter from RUST_LOG or use provided log level
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "order_fanout={},rdkafka=warn,sqlx=warn",
            log_level
        ))
    });

    if environment == "production" {
        // Production: JSON lines with span context
        let formatting_layer = fmt::layer()
            .json()
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true);

        Registry::default()
            .with(env_filter)
            .with(formatting_layer)
            .try_init()
            .map_err(|e| Error::internal(format!("Failed to initialize tracing: {}", e)))?;
    } else {
        // Development: pretty, multi-line output
        let formatting_layer = fmt::layer()
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE);

        Registry::default()
            .with(env_filter)
            .with(formatting_layer)
            .try_init()
            .map_err(|e| Error::internal(format!("Failed to initialize tracing: {}", e)))?;
    }

    tracing::info!(
        environment = environment,
        log_level = log_level,
        "Logging initialized"
    );

    Ok(())
}

/// Create a span for one pipeline invocation
#[macro_export]
macro_rules! invocation_span {
    ($partition:expr, $offset:expr) => {
        tracing::info_span!(
            "invocation",
            partition = $partition,
            offset = $offset,
            order_id = tracing::field::Empty,
            event_type = tracing::field::Empty,
            stage = tracing::field::Empty,
        )
    };
}

/// Helper for timing operations
pub struct Timer {
    start: std::time::Instant,
    operation: String,
}

impl Timer {
    /// Start a new timer
    pub fn start(operation: impl Into<String>) -> Self {
        Timer {
            start: std::time::Instant::now(),
            operation: operation.into(),
        }
    }

    /// Stop the timer and log the duration
    pub fn stop(self) -> std::time::Duration {
        let duration = self.start.elapsed();
        tracing::debug!(
            operation = %self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
        duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer() {
        let timer = Timer::start("test_operation");
        std::thread::sleep(std::time::Duration::from_millis(10));
        let duration = timer.stop();
        assert!(duration.as_millis() >= 10);
    }

    #[test]
    fn test_invocation_span() {
        let span = crate::invocation_span!(3, 42_i64);
        span.record("stage", "decoded");
    }
}
