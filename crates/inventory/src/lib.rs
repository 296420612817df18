//! Inventory reservation manager.
//!
//! Reserves stock for orders under per-product exclusive locks taken in
//! canonical (sorted product id) order, releases it on cancellation, and
//! records every outcome as an event in the transactional outbox.

pub mod error;
pub mod handler;
pub mod memory;
pub mod model;
pub mod postgres;
pub mod service;
pub mod store;

pub use error::{InventoryError, Result};
pub use handler::InventoryHandler;
pub use memory::InMemoryInventoryStore;
pub use model::{Product, ReleaseOutcome, ReserveOutcome, Reservation};
pub use postgres::PostgresInventoryStore;
pub use service::InventoryService;
pub use store::{InventoryStore, InventoryTx};

/// Outbox producer name of the inventory service.
pub const PRODUCER: &str = "inventory_service";
