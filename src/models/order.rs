//! Inbound order model and decoder
//!
//! The queue delivers a JSON body such as `{"sku":"ABC-1","quantity":5}`.
//! Decoding is strict: a missing or null field is a [`DecodeError`], never a
//! default value.

use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::str::FromStr;
use validator::Validate;

use super::error::{DecodeError, DecodeErrorKind};
use super::validation::{narrow_quantity, require_field, require_text};

/// Order body exactly as it arrives on the queue
///
/// Every field is optional here so absence can be reported per field instead
/// of as an opaque serde message.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct RawOrder {
    /// Stock keeping unit
    #[serde(default, alias = "Sku")]
    #[validate(length(min = 1))]
    pub sku: Option<String>,

    /// Ordered quantity
    #[serde(default, alias = "Quantity")]
    pub quantity: Option<i64>,
}

/// Decoded order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Stock keeping unit, never blank
    pub sku: String,

    /// Ordered quantity; negative values are passed through untouched
    pub quantity: i32,
}

impl Order {
    /// Create an order (mainly for testing)
    pub fn new(sku: impl Into<String>, quantity: i32) -> Self {
        Self {
            sku: sku.into(),
            quantity,
        }
    }
}

impl TryFrom<RawOrder> for Order {
    type Error = DecodeError;

    fn try_from(raw: RawOrder) -> Result<Self, Self::Error> {
        if raw.validate().is_err() {
            return Err(DecodeError::new(DecodeErrorKind::BlankField, "sku"));
        }

        let sku = require_text(raw.sku, "sku")?;
        let quantity = narrow_quantity(require_field(raw.quantity, "quantity")?, "quantity")?;

        Ok(Order { sku, quantity })
    }
}

impl FromStr for Order {
    type Err = DecodeError;

    fn from_str(body: &str) -> Result<Self, Self::Err> {
        let raw: RawOrder = serde_json::from_str(body)
            .map_err(|e| DecodeError::payload(DecodeErrorKind::Malformed, e.to_string()))?;
        Order::try_from(raw)
    }
}

/// Decode a raw message body into an [`Order`]
pub fn decode_order(payload: &[u8]) -> Result<Order, DecodeError> {
    let body = std::str::from_utf8(payload)
        .map_err(|e| DecodeError::payload(DecodeErrorKind::InvalidEncoding, e.to_string()))?;
    body.parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_valid_order() {
        let order = decode_order(br#"{"sku":"ABC-1","quantity":5}"#).unwrap();
        assert_eq!(order, Order::new("ABC-1", 5));
    }

    #[test]
    fn test_decode_pascal_case_fields() {
        let order: Order = r#"{"Sku":"XL-9","Quantity":5000}"#.parse().unwrap();
        assert_eq!(order.sku, "XL-9");
        assert_eq!(order.quantity, 5000);
    }

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let order = decode_order(br#"{"sku":"ABC-1","quantity":1,"note":"gift"}"#).unwrap();
        assert_eq!(order.quantity, 1);
    }

    #[test]
    fn test_missing_sku_is_rejected() {
        let err = decode_order(br#"{"quantity":5}"#).unwrap_err();
        assert!(err.is_missing("sku"));

        let err = decode_order(br#"{"sku":null,"quantity":5}"#).unwrap_err();
        assert!(err.is_missing("sku"));
    }

    #[test]
    fn test_missing_quantity_is_rejected() {
        let err = decode_order(br#"{"sku":"ABC-1"}"#).unwrap_err();
        assert!(err.is_missing("quantity"));
    }

    #[test]
    fn test_blank_sku_is_rejected() {
        for body in [r#"{"sku":"","quantity":5}"#, r#"{"sku":"   ","quantity":5}"#] {
            let err = decode_order(body.as_bytes()).unwrap_err();
            assert_eq!(err.kind, DecodeErrorKind::BlankField);
            assert_eq!(err.field.as_deref(), Some("sku"));
        }
    }

    #[test]
    fn test_malformed_payloads() {
        let cases: Vec<&[u8]> = vec![
            b"not json",
            b"[]",
            b"null",
            br#"{"sku":"ABC-1","quantity":"five"}"#,
            br#"{"sku":7,"quantity":5}"#,
        ];

        for payload in cases {
            let err = decode_order(payload).unwrap_err();
            assert_eq!(err.kind, DecodeErrorKind::Malformed);
        }
    }

    #[test]
    fn test_invalid_utf8() {
        let err = decode_order(&[0xff, 0xfe, 0x00]).unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::InvalidEncoding);
    }

    #[test]
    fn test_quantity_out_of_range() {
        let err = decode_order(br#"{"sku":"ABC-1","quantity":3000000000}"#).unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::OutOfRange);
    }

    #[test]
    fn test_negative_quantity_passes_through() {
        let order = decode_order(br#"{"sku":"ABC-1","quantity":-2}"#).unwrap();
        assert_eq!(order.quantity, -2);
    }
}
