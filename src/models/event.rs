//! Canonical order event and severity routing
//!
//! An [`OrderEvent`] is built once per inbound order and is the unit every
//! sink publishes. Its `order_id` is generated here and nowhere else, so the
//! topic, the document store and the stream all see the same value.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::order::Order;

/// Quantities strictly above this are routed as large orders
pub const LARGE_ORDER_THRESHOLD: i32 = 1000;

/// Routing label derived from the order quantity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    /// More than [`LARGE_ORDER_THRESHOLD`] units
    Large,
    /// Everything else
    Regular,
}

impl Severity {
    /// Classify a quantity
    pub fn classify(quantity: i32) -> Self {
        if quantity > LARGE_ORDER_THRESHOLD {
            Severity::Large
        } else {
            Severity::Regular
        }
    }

    /// Event type string published to the topic
    pub fn event_type(&self) -> &'static str {
        match self {
            Severity::Large => "NewOrder.Large",
            Severity::Regular => "NewOrder.Regular",
        }
    }

    /// Short label for logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Large => "large",
            Severity::Regular => "regular",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Canonical order event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderEvent {
    /// Identifier assigned when the event is built
    #[serde(rename = "orderid")]
    pub order_id: Uuid,

    /// Stock keeping unit
    pub sku: String,

    /// Ordered quantity
    pub quantity: i32,
}

impl OrderEvent {
    /// Build the event for a decoded order, assigning a fresh identifier
    pub fn from_order(order: Order) -> Self {
        Self {
            order_id: Uuid::new_v4(),
            sku: order.sku,
            quantity: order.quantity,
        }
    }

    /// Severity of this order; recomputed on every call
    pub fn severity(&self) -> Severity {
        Severity::classify(self.quantity)
    }

    /// Text payload sent to the event stream
    pub fn to_stream_payload(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl From<Order> for OrderEvent {
    fn from(order: Order) -> Self {
        OrderEvent::from_order(order)
    }
}

/// Textual form used as the stream payload
impl fmt::Display for OrderEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OrderEvent {{ orderid: {}, sku: {}, quantity: {} }}",
            self.order_id, self.sku, self.quantity
        )
    }
}
