use async_trait::async_trait;
use common::{OrderId, PaymentId, Version};
use events::EventEnvelope;

use crate::Result;
use crate::model::Payment;

/// Persistence for payments. Each method is one atomic write or read.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn get(&self, id: PaymentId) -> Result<Option<Payment>>;

    async fn find_by_order(&self, order_id: OrderId) -> Result<Option<Payment>>;

    /// Inserts the payment unless the order already has one, and returns
    /// the row that is stored for the order afterwards.
    async fn insert_if_absent(&self, payment: &Payment) -> Result<Payment>;

    /// Replaces the payment if its stored version is still `expected`, and
    /// records `event` in the outbox in the same write.
    ///
    /// A version mismatch fails with
    /// [`PaymentError::ConcurrencyConflict`](crate::PaymentError::ConcurrencyConflict)
    /// and writes nothing.
    async fn save(&self, payment: &Payment, expected: Version, event: EventEnvelope) -> Result<()>;
}
