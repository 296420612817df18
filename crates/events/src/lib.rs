//! Event envelope and registry shared by every fulfillment service.
//!
//! Every message on the bus is an [`EventEnvelope`] whose payload is one
//! variant of the closed [`Event`] union. The wire tag of each variant is an
//! [`EventType`], which doubles as the transport routing key.

pub mod envelope;
pub mod error;
pub mod payload;
pub mod registry;

pub use envelope::{EventEnvelope, EventId};
pub use error::{CodecError, Result};
pub use payload::{
    Event, InventoryInsufficientData, InventoryReleasedData, InventoryReservedData,
    OrderCancelledData, OrderConfirmedData, OrderCreatedData, OrderLine, PaymentFailedData,
    PaymentProcessedData, StockItem, DEFAULT_PAYMENT_METHOD,
};
pub use registry::{EventType, decode, decode_envelope, encode};
