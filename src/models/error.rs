//! Decode error types for inbound order messages
//!
//! Kept separate from the application [`Error`](crate::error::Error) so the
//! decoder stays a leaf with no dependency on the rest of the crate.

use std::fmt;
use thiserror::Error;

/// Failure to turn a raw message body into an [`Order`](super::Order)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    /// The kind of decode failure
    pub kind: DecodeErrorKind,
    /// The field that failed, when the failure is field-specific
    pub field: Option<String>,
    /// Optional additional context
    pub context: Option<String>,
}

impl DecodeError {
    /// Create a field-level decode error
    pub fn new(kind: DecodeErrorKind, field: impl Into<String>) -> Self {
        Self {
            kind,
            field: Some(field.into()),
            context: None,
        }
    }

    /// Create a field-level decode error with additional context
    pub fn with_context(
        kind: DecodeErrorKind,
        field: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            field: Some(field.into()),
            context: Some(context.into()),
        }
    }

    /// Create a decode error that concerns the whole payload
    pub fn payload(kind: DecodeErrorKind, context: impl Into<String>) -> Self {
        Self {
            kind,
            field: None,
            context: Some(context.into()),
        }
    }

    /// Check whether this error is about a missing field
    pub fn is_missing(&self, field: &str) -> bool {
        self.kind == DecodeErrorKind::MissingField && self.field.as_deref() == Some(field)
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.field, &self.context) {
            (Some(field), Some(ctx)) => write!(f, "field '{}': {} - {}", field, self.kind, ctx),
            (Some(field), None) => write!(f, "field '{}': {}", field, self.kind),
            (None, Some(ctx)) => write!(f, "{} - {}", self.kind, ctx),
            (None, None) => write!(f, "{}", self.kind),
        }
    }
}

/// Specific decode failure kinds
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
    /// Payload is not valid UTF-8
    #[error("Payload is not valid UTF-8")]
    InvalidEncoding,

    /// Payload is not a JSON object of the expected shape
    #[error("Malformed order payload")]
    Malformed,

    /// Field is required but missing or null
    #[error("Required field is missing")]
    MissingField,

    /// Field is present but empty or whitespace
    #[error("Field must not be blank")]
    BlankField,

    /// Numeric field does not fit the order model
    #[error("Value is out of range")]
    OutOfRange,
}
