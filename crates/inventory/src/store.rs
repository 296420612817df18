use async_trait::async_trait;
use common::{OrderId, ProductId};
use events::EventEnvelope;

use crate::model::{Product, Reservation};
use crate::Result;

/// Persistence for products and reservations.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Starts a transaction. Dropping it without [`InventoryTx::commit`]
    /// rolls back every staged change and releases its locks.
    async fn begin(&self) -> Result<Box<dyn InventoryTx>>;

    async fn get_product(&self, id: &ProductId) -> Result<Option<Product>>;

    /// All products ordered by id.
    async fn list_products(&self) -> Result<Vec<Product>>;

    /// All reservations of an order, released or not, ordered by product id.
    async fn reservations_for_order(&self, order_id: OrderId) -> Result<Vec<Reservation>>;
}

/// A unit of work holding exclusive locks until commit or drop.
///
/// Lock waits are bounded; a timeout surfaces as
/// [`InventoryError::ConcurrencyConflict`](crate::InventoryError::ConcurrencyConflict).
#[async_trait]
pub trait InventoryTx: Send {
    /// Serializes every transaction touching the same order.
    async fn lock_order(&mut self, order_id: OrderId) -> Result<()>;

    /// Locks a product row and returns its current state, or `None` if the
    /// product does not exist. Callers lock products in ascending id order.
    async fn lock_product(&mut self, id: &ProductId) -> Result<Option<Product>>;

    /// Reservations of an order as seen by this transaction.
    async fn reservations_for_order(&mut self, order_id: OrderId) -> Result<Vec<Reservation>>;

    /// True if the order was released while holding no reservations.
    async fn is_order_released(&mut self, order_id: OrderId) -> Result<bool>;

    /// Remembers that the order was released so a late reservation is skipped.
    async fn mark_order_released(&mut self, order_id: OrderId) -> Result<()>;

    async fn insert_product(&mut self, product: &Product) -> Result<()>;

    /// Writes a product previously returned by [`lock_product`](Self::lock_product).
    async fn update_product(&mut self, product: &Product) -> Result<()>;

    async fn insert_reservation(&mut self, reservation: &Reservation) -> Result<()>;

    async fn update_reservation(&mut self, reservation: &Reservation) -> Result<()>;

    /// Stages an event for the outbox; it becomes visible on commit.
    async fn enqueue(&mut self, envelope: EventEnvelope) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
}
