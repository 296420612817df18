use async_trait::async_trait;
use common::{OrderId, UserId, Version};
use events::EventEnvelope;

use crate::Result;
use crate::aggregate::Order;
use crate::state::OrderStatus;

/// Filter and page for order listings. Results are newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderQuery {
    pub user_id: Option<UserId>,
    pub status: Option<OrderStatus>,
    pub offset: usize,
    pub limit: usize,
}

impl OrderQuery {
    pub const DEFAULT_LIMIT: usize = 100;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn status(mut self, status: OrderStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = limit;
        self
    }

    pub fn matches(&self, order: &Order) -> bool {
        self.user_id.as_ref().is_none_or(|u| *u == order.user_id)
            && self.status.is_none_or(|s| s == order.status)
    }
}

impl Default for OrderQuery {
    fn default() -> Self {
        Self {
            user_id: None,
            status: None,
            offset: 0,
            limit: Self::DEFAULT_LIMIT,
        }
    }
}

/// Persistence for orders. Every write also records its events in the
/// outbox, atomically.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn insert(&self, order: &Order, event: EventEnvelope) -> Result<()>;

    async fn get(&self, id: OrderId) -> Result<Option<Order>>;

    async fn list(&self, query: &OrderQuery) -> Result<Vec<Order>>;

    /// Replaces the order if its stored version is still `expected`.
    ///
    /// A mismatch fails with
    /// [`OrderError::ConcurrencyConflict`](crate::OrderError::ConcurrencyConflict)
    /// and writes nothing.
    async fn save(&self, order: &Order, expected: Version, event: Option<EventEnvelope>) -> Result<()>;
}
