//! Data models for order-fanout
//!
//! The inbound [`Order`], its decoder, and the canonical [`OrderEvent`] every
//! sink publishes.

pub mod error;
pub mod event;
pub mod order;
pub mod validation;

// Re-export commonly used types
pub use error::{DecodeError, DecodeErrorKind};
pub use event::{OrderEvent, Severity, LARGE_ORDER_THRESHOLD};
pub use order::{decode_order, Order, RawOrder};
