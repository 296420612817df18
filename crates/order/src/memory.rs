use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::{OrderId, Version};
use events::EventEnvelope;
use tokio::sync::RwLock;
use transport::InMemoryOutbox;

use crate::aggregate::Order;
use crate::store::{OrderQuery, OrderStore};
use crate::{OrderError, Result};

/// In-memory order store sharing an outbox with the relay.
#[derive(Debug, Clone)]
pub struct InMemoryOrderStore {
    orders: Arc<RwLock<HashMap<OrderId, Order>>>,
    outbox: InMemoryOutbox,
}

impl InMemoryOrderStore {
    pub fn new(outbox: InMemoryOutbox) -> Self {
        Self {
            orders: Arc::new(RwLock::new(HashMap::new())),
            outbox,
        }
    }

    pub fn outbox(&self) -> &InMemoryOutbox {
        &self.outbox
    }
}

impl Default for InMemoryOrderStore {
    fn default() -> Self {
        Self::new(InMemoryOutbox::new())
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn insert(&self, order: &Order, event: EventEnvelope) -> Result<()> {
        let mut orders = self.orders.write().await;
        if orders.contains_key(&order.id) {
            return Err(OrderError::ConcurrencyConflict(format!(
                "order {} already exists",
                order.id
            )));
        }
        orders.insert(order.id, order.clone());
        self.outbox.push(event);
        Ok(())
    }

    async fn get(&self, id: OrderId) -> Result<Option<Order>> {
        Ok(self.orders.read().await.get(&id).cloned())
    }

    async fn list(&self, query: &OrderQuery) -> Result<Vec<Order>> {
        let orders = self.orders.read().await;
        let mut matching: Vec<&Order> = orders.values().filter(|o| query.matches(o)).collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(matching
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .cloned()
            .collect())
    }

    async fn save(&self, order: &Order, expected: Version, event: Option<EventEnvelope>) -> Result<()> {
        let mut orders = self.orders.write().await;
        let current = orders.get_mut(&order.id).ok_or(OrderError::NotFound(order.id))?;
        if current.version != expected {
            return Err(OrderError::ConcurrencyConflict(format!(
                "order {} is at version {}, expected {}",
                order.id, current.version, expected
            )));
        }

        *current = order.clone();
        self.outbox.push_all(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::OrderStatus;
    use chrono::{Duration, Utc};
    use common::{Money, UserId};
    use events::OrderLine;

    fn order(user: &str, minutes_ago: i64) -> Order {
        Order::create(
            OrderId::new(),
            UserId::new(user),
            vec![OrderLine::new("P1", 1, Money::from_cents(100))],
            Utc::now() - Duration::minutes(minutes_ago),
        )
        .unwrap()
    }

    async fn insert(store: &InMemoryOrderStore, o: &Order) {
        store
            .insert(o, EventEnvelope::new(o.created_event()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn list_filters_and_sorts_newest_first() {
        let store = InMemoryOrderStore::default();
        let old = order("u1", 10);
        let new = order("u1", 1);
        let other = order("u2", 5);
        for o in [&old, &new, &other] {
            insert(&store, o).await;
        }

        let mine = store.list(&OrderQuery::new().user(UserId::new("u1"))).await.unwrap();
        assert_eq!(
            mine.iter().map(|o| o.id).collect::<Vec<_>>(),
            vec![new.id, old.id]
        );

        let page = store.list(&OrderQuery::new().page(1, 1)).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, other.id);

        let cancelled = store
            .list(&OrderQuery::new().status(OrderStatus::Cancelled))
            .await
            .unwrap();
        assert!(cancelled.is_empty());
    }

    #[tokio::test]
    async fn stale_save_is_a_conflict() {
        let store = InMemoryOrderStore::default();
        let o = order("u1", 0);
        insert(&store, &o).await;

        let (first, event) = o.cancel("one", Utc::now()).unwrap().unwrap();
        store
            .save(&first, o.version, Some(EventEnvelope::new(event)))
            .await
            .unwrap();

        let (second, event) = o.cancel("two", Utc::now()).unwrap().unwrap();
        let result = store.save(&second, o.version, Some(EventEnvelope::new(event))).await;

        assert!(matches!(result, Err(OrderError::ConcurrencyConflict(_))));
        assert_eq!(store.outbox().pending_count(), 2);
        let stored = store.get(o.id).await.unwrap().unwrap();
        assert_eq!(stored.cancellation_reason.as_deref(), Some("one"));
    }
}
