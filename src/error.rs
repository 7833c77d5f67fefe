//! Error handling module for order-fanout
//!
//! Every failure an invocation can hit is one variant of [`Error`]. None of
//! them is recovered inside the pipeline: the first one aborts the remaining
//! steps and is reported to the host.

use thiserror::Error;

use crate::credentials::CredentialError;
use crate::models::DecodeError;
use crate::sinks::stream::StreamSendError;

/// Result type alias for order-fanout operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for order-fanout
#[derive(Error, Debug)]
pub enum Error {
    /// Inbound message could not be decoded into an order
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A required credential-cache setting is absent
    #[error("Missing configuration: {0}")]
    ConfigMissing(String),

    /// The secret store rejected the application identity
    #[error("Authentication error: {0}")]
    Auth(String),

    /// The stream connection secret could not be fetched
    #[error("Secret fetch error: {0}")]
    SecretFetch(String),

    /// Topic (Event Grid) publish failed
    #[error("Publish error: {0}")]
    Publish(String),

    /// Document store append failed
    #[error("Store write error: {0}")]
    StoreWrite(String),

    /// Event stream send failed, including any credential failure behind it
    #[error("Stream send error: {0}")]
    StreamSend(#[from] StreamSendError),

    /// Invalid service configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The invocation deadline elapsed
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    /// Create a topic publish error
    pub fn publish<S: Into<String>>(msg: S) -> Self {
        Error::Publish(msg.into())
    }

    /// Create a document store write error
    pub fn store_write<S: Into<String>>(msg: S) -> Self {
        Error::StoreWrite(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    /// Stable label used in logs and dead-letter records
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::Decode(_) => "decode_error",
            Error::ConfigMissing(_) => "config_missing_error",
            Error::Auth(_) => "auth_error",
            Error::SecretFetch(_) => "secret_fetch_error",
            Error::Publish(_) => "publish_error",
            Error::StoreWrite(_) => "store_write_error",
            Error::StreamSend(_) => "stream_send_error",
            Error::Config(_) => "configuration_error",
            Error::Serialization(_) => "serialization_error",
            Error::Io(_) => "io_error",
            Error::Timeout(_) => "timeout",
            Error::Internal(_) => "internal_error",
        }
    }

    /// Whether the failure came from a downstream sink
    pub fn is_sink_failure(&self) -> bool {
        matches!(
            self,
            Error::Publish(_) | Error::StoreWrite(_) | Error::StreamSend(_)
        )
    }
}

/// Credential failures outside the stream sink keep their own variants
impl From<CredentialError> for Error {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::ConfigMissing(msg) => Error::ConfigMissing(msg),
            CredentialError::Auth(msg) => Error::Auth(msg),
            CredentialError::SecretFetch(msg) => Error::SecretFetch(msg),
            CredentialError::InvalidConnectionString(msg) => Error::SecretFetch(msg),
        }
    }
}

/// Convert from anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

/// Convert from envconfig::Error to our Error type
impl From<envconfig::Error> for Error {
    fn from(err: envconfig::Error) -> Self {
        Error::Config(err.to_string())
    }
}
