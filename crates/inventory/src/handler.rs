use std::sync::Arc;

use async_trait::async_trait;
use events::{Event, EventEnvelope, EventType, StockItem};
use transport::{HandlerError, MessageHandler, QueueSpec};

use crate::service::InventoryService;
use crate::InventoryError;

/// Queue the inventory service consumes order events from.
pub const QUEUE: &str = "inventory_service.orders";

/// Reserves stock on `order.created` and releases it on `order.cancelled`.
pub struct InventoryHandler {
    service: Arc<InventoryService>,
}

impl InventoryHandler {
    pub fn new(service: Arc<InventoryService>) -> Self {
        Self { service }
    }

    /// Declaration of the queue this handler consumes.
    pub fn queue_spec() -> QueueSpec {
        QueueSpec::new(QUEUE)
            .bind(EventType::OrderCreated.as_str())
            .bind(EventType::OrderCancelled.as_str())
    }
}

fn to_handler_error(e: InventoryError) -> HandlerError {
    if e.is_transient() {
        HandlerError::Transient(e.to_string())
    } else {
        HandlerError::Rejected(e.to_string())
    }
}

#[async_trait]
impl MessageHandler for InventoryHandler {
    fn name(&self) -> &str {
        "inventory"
    }

    async fn handle(&self, envelope: EventEnvelope) -> Result<(), HandlerError> {
        match envelope.payload {
            Event::OrderCreated(data) => {
                let items: Vec<StockItem> = data.items.iter().map(StockItem::from).collect();
                self.service
                    .reserve(data.order_id, &items, data.total_amount, &envelope.correlation_id)
                    .await
                    .map(|_| ())
                    .map_err(to_handler_error)
            }
            Event::OrderCancelled(data) => self
                .service
                .release(data.order_id, &data.reason, &envelope.correlation_id)
                .await
                .map(|_| ())
                .map_err(to_handler_error),
            other => {
                tracing::debug!(event_type = %other.event_type(), "Ignoring event");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryInventoryStore;
    use crate::store::InventoryStore;
    use common::{Money, OrderId, ProductId, SystemClock, UserId};
    use events::{OrderCancelledData, OrderCreatedData, OrderLine};

    async fn setup() -> (InMemoryInventoryStore, InventoryHandler) {
        let store = InMemoryInventoryStore::default();
        let service = Arc::new(InventoryService::new(Arc::new(store.clone()), Arc::new(SystemClock)));
        service.create_product(ProductId::new("P1"), "Widget", 5).await.unwrap();
        (store, InventoryHandler::new(service))
    }

    fn created(order_id: OrderId, quantity: u32) -> EventEnvelope {
        EventEnvelope::new(Event::OrderCreated(OrderCreatedData {
            order_id,
            user_id: UserId::new("u1"),
            items: vec![OrderLine::new("P1", quantity, Money::from_cents(1000))],
            total_amount: Money::from_cents(1000 * quantity as i64),
        }))
    }

    #[tokio::test]
    async fn order_created_reserves_and_order_cancelled_releases() {
        let (store, handler) = setup().await;
        let order_id = OrderId::new();

        handler.handle(created(order_id, 2)).await.unwrap();
        let product = store.get_product(&ProductId::new("P1")).await.unwrap().unwrap();
        assert_eq!(product.reserved_quantity, 2);

        let cancelled = EventEnvelope::new(Event::OrderCancelled(OrderCancelledData {
            order_id,
            user_id: UserId::new("u1"),
            reason: "changed mind".to_string(),
        }));
        handler.handle(cancelled).await.unwrap();
        let product = store.get_product(&ProductId::new("P1")).await.unwrap().unwrap();
        assert_eq!(product.reserved_quantity, 0);
    }

    #[tokio::test]
    async fn invalid_order_is_rejected() {
        let (_store, handler) = setup().await;
        let result = handler.handle(created(OrderId::new(), 0)).await;
        assert!(matches!(result, Err(HandlerError::Rejected(_))));
    }

    #[test]
    fn queue_binds_order_events() {
        let spec = InventoryHandler::queue_spec();
        assert_eq!(spec.name, "inventory_service.orders");
        assert_eq!(spec.routing_keys, vec!["order.created", "order.cancelled"]);
    }
}
