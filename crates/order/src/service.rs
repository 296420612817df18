use std::sync::Arc;

use common::{Clock, OrderId, UserId};
use events::{Event, EventEnvelope, OrderLine};

use crate::aggregate::{Order, Reaction};
use crate::state::OrderStatus;
use crate::store::{OrderQuery, OrderStore};
use crate::{OrderError, Result};

/// What applying a saga event did to its order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// The order moved to this status.
    Applied(OrderStatus),
    /// Duplicate, stale or irrelevant; nothing changed.
    Ignored,
    /// The order is not ready for the event yet.
    Deferred,
}

/// Order commands and saga event handling.
pub struct OrderService {
    store: Arc<dyn OrderStore>,
    clock: Arc<dyn Clock>,
}

impl OrderService {
    pub fn new(store: Arc<dyn OrderStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    fn envelope(&self, order: &Order, event: Event) -> EventEnvelope {
        EventEnvelope::new(event)
            .with_timestamp(self.clock.now())
            .with_correlation_id(order.id.into())
    }

    /// Creates a `Pending` order and records `order.created`.
    #[tracing::instrument(skip(self, user_id, items), fields(user_id = %user_id, items = items.len()))]
    pub async fn create_order(&self, user_id: UserId, items: Vec<OrderLine>) -> Result<Order> {
        let order = Order::create(OrderId::new(), user_id, items, self.clock.now())?;
        let event = self.envelope(&order, order.created_event());
        self.store.insert(&order, event).await?;

        metrics::counter!("orders_created_total").increment(1);
        tracing::info!(order_id = %order.id, total = %order.total_amount, "Order created");
        Ok(order)
    }

    pub async fn get_order(&self, order_id: OrderId) -> Result<Order> {
        self.store
            .get(order_id)
            .await?
            .ok_or(OrderError::NotFound(order_id))
    }

    pub async fn list_orders(&self, query: &OrderQuery) -> Result<Vec<Order>> {
        self.store.list(query).await
    }

    /// Cancels an order on request.
    ///
    /// Cancelling a cancelled order returns it unchanged; a confirmed order
    /// cannot be cancelled.
    #[tracing::instrument(skip(self, reason), fields(order_id = %order_id))]
    pub async fn cancel_order(&self, order_id: OrderId, reason: &str) -> Result<Order> {
        let order = self.get_order(order_id).await?;
        let Some((next, event)) = order.cancel(reason, self.clock.now())? else {
            tracing::debug!("Order already cancelled");
            return Ok(order);
        };

        let envelope = self.envelope(&next, event);
        self.store.save(&next, order.version, Some(envelope)).await?;
        record_transition(order.status, next.status);
        tracing::info!(reason, "Order cancelled");
        Ok(next)
    }

    /// Applies an inventory or payment outcome to its order.
    #[tracing::instrument(
        skip(self, envelope),
        fields(
            event_type = %envelope.event_type(),
            order_id = %envelope.payload.order_id(),
            correlation_id = %envelope.correlation_id,
        )
    )]
    pub async fn apply_event(&self, envelope: &EventEnvelope) -> Result<EventOutcome> {
        let order = self.get_order(envelope.payload.order_id()).await?;

        match order.react(&envelope.payload, self.clock.now()) {
            Reaction::Transition { next, emit } => {
                let emit = emit.map(|event| self.envelope(&next, event));
                self.store.save(&next, order.version, emit).await?;
                record_transition(order.status, next.status);
                tracing::info!(from = %order.status, to = %next.status, "Order transitioned");
                Ok(EventOutcome::Applied(next.status))
            }
            Reaction::Ignore { reason } => {
                tracing::debug!(status = %order.status, reason, "Event ignored");
                metrics::counter!("order_events_ignored_total").increment(1);
                Ok(EventOutcome::Ignored)
            }
            Reaction::Defer => {
                tracing::debug!(status = %order.status, "Event arrived early, deferring");
                Ok(EventOutcome::Deferred)
            }
        }
    }
}

fn record_transition(from: OrderStatus, to: OrderStatus) {
    metrics::counter!(
        "order_transitions_total",
        "from" => from.as_str(),
        "to" => to.as_str()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryOrderStore;
    use common::{CorrelationId, Money, PaymentId, SystemClock};
    use events::{
        InventoryInsufficientData, InventoryReservedData, PaymentFailedData,
        PaymentProcessedData, StockItem,
    };

    fn setup() -> (InMemoryOrderStore, OrderService) {
        let store = InMemoryOrderStore::default();
        let service = OrderService::new(Arc::new(store.clone()), Arc::new(SystemClock));
        (store, service)
    }

    async fn create(service: &OrderService) -> Order {
        service
            .create_order(
                UserId::new("u1"),
                vec![OrderLine::new("P1", 2, Money::from_cents(1000))],
            )
            .await
            .unwrap()
    }

    fn reserved(order: &Order) -> EventEnvelope {
        EventEnvelope::new(Event::InventoryReserved(InventoryReservedData {
            order_id: order.id,
            items: vec![StockItem::new("P1", 2)],
            total_amount: order.total_amount,
        }))
    }

    fn insufficient(order: &Order) -> EventEnvelope {
        EventEnvelope::new(Event::InventoryInsufficient(InventoryInsufficientData {
            order_id: order.id,
            unavailable_items: vec![StockItem::new("P1", 2)],
        }))
    }

    fn processed(order: &Order) -> EventEnvelope {
        EventEnvelope::new(Event::PaymentProcessed(PaymentProcessedData {
            order_id: order.id,
            payment_id: PaymentId::new(),
            amount: order.total_amount,
            transaction_id: "txn_0123456789ab".to_string(),
            payment_method: "credit_card".to_string(),
        }))
    }

    fn failed(order: &Order) -> EventEnvelope {
        EventEnvelope::new(Event::PaymentFailed(PaymentFailedData {
            order_id: order.id,
            payment_id: PaymentId::new(),
            user_id: order.user_id.clone(),
            amount: order.total_amount,
            reason: "Insufficient funds".to_string(),
        }))
    }

    fn event_types(store: &InMemoryOrderStore) -> Vec<&'static str> {
        store
            .outbox()
            .all()
            .iter()
            .map(|e| e.event_type().as_str())
            .collect()
    }

    #[tokio::test]
    async fn create_order_records_created_event() {
        let (store, service) = setup();
        let order = create(&service).await;

        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.total_amount, Money::from_cents(2000));

        let events = store.outbox().all();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].correlation_id, CorrelationId::from(order.id));
        match &events[0].payload {
            Event::OrderCreated(data) => {
                assert_eq!(data.order_id, order.id);
                assert_eq!(data.items, order.items);
                assert_eq!(data.total_amount, Money::from_cents(2000));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_order_records_nothing() {
        let (store, service) = setup();
        let result = service.create_order(UserId::new("u1"), vec![]).await;
        assert!(matches!(result, Err(OrderError::Validation(_))));
        assert_eq!(store.outbox().pending_count(), 0);
    }

    #[tokio::test]
    async fn reserved_then_paid_confirms() {
        let (store, service) = setup();
        let order = create(&service).await;

        assert_eq!(
            service.apply_event(&reserved(&order)).await.unwrap(),
            EventOutcome::Applied(OrderStatus::Processing)
        );
        assert_eq!(
            service.apply_event(&processed(&order)).await.unwrap(),
            EventOutcome::Applied(OrderStatus::Confirmed)
        );

        let stored = service.get_order(order.id).await.unwrap();
        assert_eq!(stored.status, OrderStatus::Confirmed);
        assert_eq!(event_types(&store), vec!["order.created", "order.confirmed"]);
    }

    #[tokio::test]
    async fn insufficient_inventory_cancels() {
        let (store, service) = setup();
        let order = create(&service).await;

        service.apply_event(&insufficient(&order)).await.unwrap();

        let stored = service.get_order(order.id).await.unwrap();
        assert_eq!(stored.status, OrderStatus::Cancelled);
        assert_eq!(stored.cancellation_reason.as_deref(), Some("insufficient inventory"));
        assert_eq!(event_types(&store), vec!["order.created", "order.cancelled"]);
    }

    #[tokio::test]
    async fn payment_failure_cancels() {
        let (store, service) = setup();
        let order = create(&service).await;

        service.apply_event(&reserved(&order)).await.unwrap();
        service.apply_event(&failed(&order)).await.unwrap();

        let stored = service.get_order(order.id).await.unwrap();
        assert_eq!(stored.status, OrderStatus::Cancelled);
        assert_eq!(stored.cancellation_reason.as_deref(), Some("Insufficient funds"));
        assert_eq!(event_types(&store), vec!["order.created", "order.cancelled"]);
    }

    #[tokio::test]
    async fn duplicates_and_late_events_change_nothing() {
        let (store, service) = setup();
        let order = create(&service).await;

        service.apply_event(&reserved(&order)).await.unwrap();
        assert_eq!(
            service.apply_event(&reserved(&order)).await.unwrap(),
            EventOutcome::Ignored
        );
        service.apply_event(&processed(&order)).await.unwrap();
        assert_eq!(
            service.apply_event(&failed(&order)).await.unwrap(),
            EventOutcome::Ignored
        );

        let stored = service.get_order(order.id).await.unwrap();
        assert_eq!(stored.status, OrderStatus::Confirmed);
        assert_eq!(store.outbox().pending_count(), 2);
    }

    #[tokio::test]
    async fn early_payment_is_deferred() {
        let (store, service) = setup();
        let order = create(&service).await;

        assert_eq!(
            service.apply_event(&processed(&order)).await.unwrap(),
            EventOutcome::Deferred
        );
        assert_eq!(service.get_order(order.id).await.unwrap().status, OrderStatus::Pending);
        assert_eq!(store.outbox().pending_count(), 1);
    }

    #[tokio::test]
    async fn event_for_unknown_order_is_not_found() {
        let (_store, service) = setup();
        let ghost = Order::create(
            OrderId::new(),
            UserId::new("u1"),
            vec![OrderLine::new("P1", 1, Money::zero())],
            chrono::Utc::now(),
        )
        .unwrap();
        let result = service.apply_event(&reserved(&ghost)).await;
        assert!(matches!(result, Err(OrderError::NotFound(_))));
    }

    #[tokio::test]
    async fn cancel_order_rules() {
        let (store, service) = setup();

        let missing = service.cancel_order(OrderId::new(), "x").await;
        assert!(matches!(missing, Err(OrderError::NotFound(_))));

        let order = create(&service).await;
        let cancelled = service.cancel_order(order.id, "changed mind").await.unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);

        let again = service.cancel_order(order.id, "again").await.unwrap();
        assert_eq!(again.cancellation_reason.as_deref(), Some("changed mind"));
        assert_eq!(event_types(&store), vec!["order.created", "order.cancelled"]);

        let confirmed = create(&service).await;
        service.apply_event(&reserved(&confirmed)).await.unwrap();
        service.apply_event(&processed(&confirmed)).await.unwrap();
        let result = service.cancel_order(confirmed.id, "too late").await;
        assert!(matches!(result, Err(OrderError::InvalidStateTransition { .. })));
    }

    #[tokio::test]
    async fn list_orders_filters_by_user_and_status() {
        let (_store, service) = setup();
        let a = create(&service).await;
        let b = create(&service).await;
        service
            .create_order(UserId::new("u2"), vec![OrderLine::new("P1", 1, Money::zero())])
            .await
            .unwrap();
        service.cancel_order(a.id, "x").await.unwrap();

        let mine = service
            .list_orders(&OrderQuery::new().user(UserId::new("u1")))
            .await
            .unwrap();
        assert_eq!(mine.len(), 2);

        let pending = service
            .list_orders(
                &OrderQuery::new()
                    .user(UserId::new("u1"))
                    .status(OrderStatus::Pending),
            )
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, b.id);
    }

    #[tokio::test]
    async fn concurrent_transitions_conflict_instead_of_overwriting() {
        let (store, service) = setup();
        let order = create(&service).await;
        service.apply_event(&reserved(&order)).await.unwrap();

        // A user cancel racing a payment: replay the payment against the
        // version read before the cancel was saved.
        let stale = service.get_order(order.id).await.unwrap();
        service.cancel_order(order.id, "changed mind").await.unwrap();

        let Reaction::Transition { next, .. } =
            stale.react(&processed(&order).payload, chrono::Utc::now())
        else {
            panic!("expected transition");
        };
        let result = store.save(&next, stale.version, None).await;
        assert!(matches!(result, Err(OrderError::ConcurrencyConflict(_))));
        assert_eq!(
            service.get_order(order.id).await.unwrap().status,
            OrderStatus::Cancelled
        );
    }
}
