//! Payment settlement simulator.
//!
//! Settles at most one payment per order. Replays return the recorded
//! outcome; the terminal state and its event are written in one step.

pub mod error;
pub mod memory;
pub mod model;
pub mod postgres;
pub mod service;
pub mod settlement;
pub mod store;

pub use error::{PaymentError, Result};
pub use memory::InMemoryPaymentStore;
pub use model::{Payment, PaymentOutcome, PaymentStatus};
pub use postgres::PostgresPaymentStore;
pub use service::PaymentService;
pub use settlement::{Decision, FixedSettlement, RandomSettlement, SettlementDecider};
pub use store::PaymentStore;

/// Outbox producer name of the payment service.
pub const PRODUCER: &str = "payment_service";
