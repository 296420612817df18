//! Shared types used by every fulfillment service.

pub mod clock;
pub mod money;
pub mod types;

pub use clock::{Clock, FixedClock, SystemClock};
pub use money::{Money, MoneyError};
pub use types::{
    CorrelationId, OrderId, PaymentId, ProductId, ReservationId, UserId, Version,
};
