//! Order lifecycle.
//!
//! Orders are created `Pending` and advanced by inventory and payment
//! events until they are `Confirmed` or `Cancelled`. Every transition and
//! the event it emits are saved in one write.

pub mod aggregate;
pub mod error;
pub mod handler;
pub mod memory;
pub mod postgres;
pub mod service;
pub mod state;
pub mod store;

pub use aggregate::{Order, Reaction};
pub use error::{OrderError, Result};
pub use handler::OrderHandler;
pub use memory::InMemoryOrderStore;
pub use postgres::PostgresOrderStore;
pub use service::{EventOutcome, OrderService};
pub use state::OrderStatus;
pub use store::{OrderQuery, OrderStore};

/// Outbox producer name of the order service.
pub const PRODUCER: &str = "order_service";
