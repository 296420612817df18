//! Typed payloads for every event in the registry.

use common::{Money, OrderId, PaymentId, ProductId, UserId};
use serde::{Deserialize, Serialize, Serializer};

use crate::registry::EventType;

/// A priced line of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: ProductId,
    pub quantity: u32,
    /// Unit price.
    pub price: Money,
}

impl OrderLine {
    pub fn new(product_id: impl Into<ProductId>, quantity: u32, price: Money) -> Self {
        Self {
            product_id: product_id.into(),
            quantity,
            price,
        }
    }

    /// Returns quantity * price, or `None` if it overflows.
    pub fn subtotal(&self) -> Option<Money> {
        self.price.checked_mul(self.quantity)
    }
}

/// A product quantity without price, used by inventory events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockItem {
    pub product_id: ProductId,
    pub quantity: u32,
}

impl StockItem {
    pub fn new(product_id: impl Into<ProductId>, quantity: u32) -> Self {
        Self {
            product_id: product_id.into(),
            quantity,
        }
    }
}

impl From<&OrderLine> for StockItem {
    fn from(line: &OrderLine) -> Self {
        Self {
            product_id: line.product_id.clone(),
            quantity: line.quantity,
        }
    }
}

/// Data for `order.created`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCreatedData {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub items: Vec<OrderLine>,
    pub total_amount: Money,
}

/// Data for `order.confirmed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderConfirmedData {
    pub order_id: OrderId,
    pub user_id: UserId,
}

/// Data for `order.cancelled`. This is the compensating signal for inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCancelledData {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub reason: String,
}

/// Data for `inventory.reserved`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryReservedData {
    pub order_id: OrderId,
    pub items: Vec<StockItem>,
    pub total_amount: Money,
}

/// Data for `inventory.released`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryReleasedData {
    pub order_id: OrderId,
    pub items: Vec<StockItem>,
    pub reason: String,
}

/// Data for `inventory.insufficient`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryInsufficientData {
    pub order_id: OrderId,
    pub unavailable_items: Vec<StockItem>,
}

/// Payment method assumed when a request or an older event names none.
pub const DEFAULT_PAYMENT_METHOD: &str = "credit_card";

fn default_payment_method() -> String {
    DEFAULT_PAYMENT_METHOD.to_string()
}

/// Data for `payment.processed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentProcessedData {
    pub order_id: OrderId,
    pub payment_id: PaymentId,
    pub amount: Money,
    pub transaction_id: String,
    #[serde(default = "default_payment_method")]
    pub payment_method: String,
}

/// Data for `payment.failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentFailedData {
    pub order_id: OrderId,
    pub payment_id: PaymentId,
    pub user_id: UserId,
    pub amount: Money,
    pub reason: String,
}

/// The closed set of saga events.
///
/// Serializes as the bare payload of the variant; the tag travels separately
/// in the envelope's `event_type`.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    OrderCreated(OrderCreatedData),
    OrderConfirmed(OrderConfirmedData),
    OrderCancelled(OrderCancelledData),
    InventoryReserved(InventoryReservedData),
    InventoryReleased(InventoryReleasedData),
    InventoryInsufficient(InventoryInsufficientData),
    PaymentProcessed(PaymentProcessedData),
    PaymentFailed(PaymentFailedData),
}

impl Event {
    /// Returns the registry tag of this event.
    pub fn event_type(&self) -> EventType {
        match self {
            Event::OrderCreated(_) => EventType::OrderCreated,
            Event::OrderConfirmed(_) => EventType::OrderConfirmed,
            Event::OrderCancelled(_) => EventType::OrderCancelled,
            Event::InventoryReserved(_) => EventType::InventoryReserved,
            Event::InventoryReleased(_) => EventType::InventoryReleased,
            Event::InventoryInsufficient(_) => EventType::InventoryInsufficient,
            Event::PaymentProcessed(_) => EventType::PaymentProcessed,
            Event::PaymentFailed(_) => EventType::PaymentFailed,
        }
    }

    /// Returns the order this event belongs to.
    pub fn order_id(&self) -> OrderId {
        match self {
            Event::OrderCreated(d) => d.order_id,
            Event::OrderConfirmed(d) => d.order_id,
            Event::OrderCancelled(d) => d.order_id,
            Event::InventoryReserved(d) => d.order_id,
            Event::InventoryReleased(d) => d.order_id,
            Event::InventoryInsufficient(d) => d.order_id,
            Event::PaymentProcessed(d) => d.order_id,
            Event::PaymentFailed(d) => d.order_id,
        }
    }
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Event::OrderCreated(d) => d.serialize(serializer),
            Event::OrderConfirmed(d) => d.serialize(serializer),
            Event::OrderCancelled(d) => d.serialize(serializer),
            Event::InventoryReserved(d) => d.serialize(serializer),
            Event::InventoryReleased(d) => d.serialize(serializer),
            Event::InventoryInsufficient(d) => d.serialize(serializer),
            Event::PaymentProcessed(d) => d.serialize(serializer),
            Event::PaymentFailed(d) => d.serialize(serializer),
        }
    }
}
