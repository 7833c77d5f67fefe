//! Field validation helpers for inbound orders

use super::error::{DecodeError, DecodeErrorKind};

/// Require an optional field to be present
pub fn require_field<T>(value: Option<T>, field_name: &str) -> Result<T, DecodeError> {
    value.ok_or_else(|| DecodeError::new(DecodeErrorKind::MissingField, field_name))
}

/// Require a text field to be present and not blank
pub fn require_text(value: Option<String>, field_name: &str) -> Result<String, DecodeError> {
    let value = require_field(value, field_name)?;
    if value.trim().is_empty() {
        return Err(DecodeError::new(DecodeErrorKind::BlankField, field_name));
    }
    Ok(value)
}

/// Narrow a JSON integer to the 32-bit quantity the order model carries
pub fn narrow_quantity(value: i64, field_name: &str) -> Result<i32, DecodeError> {
    i32::try_from(value).map_err(|_| {
        DecodeError::with_context(
            DecodeErrorKind::OutOfRange,
            field_name,
            format!("{} does not fit in a 32-bit integer", value),
        )
    })
}
