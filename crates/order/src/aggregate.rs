//! Order aggregate.

use chrono::{DateTime, Utc};
use common::{Money, OrderId, UserId, Version};
use events::{Event, OrderCancelledData, OrderConfirmedData, OrderCreatedData, OrderLine};
use serde::{Deserialize, Serialize};

use crate::state::OrderStatus;
use crate::{OrderError, Result};

/// Cancellation reason recorded when inventory cannot be reserved.
pub const INSUFFICIENT_INVENTORY_REASON: &str = "insufficient inventory";

/// An order and its position in the saga.
///
/// `items` and `total_amount` never change after creation; `version`
/// increases by one on every saved transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub user_id: UserId,
    pub status: OrderStatus,
    pub items: Vec<OrderLine>,
    pub total_amount: Money,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub version: Version,
}

/// How an order responds to an incoming saga event.
#[derive(Debug, Clone, PartialEq)]
pub enum Reaction {
    /// The order moves to `next`, emitting `emit` if present.
    Transition { next: Order, emit: Option<Event> },
    /// The event is stale or does not apply; nothing changes.
    Ignore { reason: &'static str },
    /// The event arrived before the order can accept it.
    Defer,
}

impl Order {
    /// Validates and prices a new order.
    pub fn create(
        id: OrderId,
        user_id: UserId,
        items: Vec<OrderLine>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        if user_id.is_blank() {
            return Err(OrderError::Validation("user id must not be empty".to_string()));
        }
        if items.is_empty() {
            return Err(OrderError::Validation("order must contain at least one item".to_string()));
        }

        let mut total = Money::zero();
        for line in &items {
            if line.product_id.is_blank() {
                return Err(OrderError::Validation("product id must not be empty".to_string()));
            }
            if line.quantity == 0 {
                return Err(OrderError::Validation(format!(
                    "quantity for {} must be greater than 0",
                    line.product_id
                )));
            }
            if line.price.is_negative() {
                return Err(OrderError::Validation(format!(
                    "price for {} must not be negative",
                    line.product_id
                )));
            }
            total = line
                .subtotal()
                .and_then(|subtotal| total.checked_add(subtotal))
                .ok_or_else(|| OrderError::Validation("order total is too large".to_string()))?;
        }

        Ok(Self {
            id,
            user_id,
            status: OrderStatus::Pending,
            items,
            total_amount: total,
            created_at: now,
            updated_at: now,
            confirmed_at: None,
            cancelled_at: None,
            cancellation_reason: None,
            version: Version::first(),
        })
    }

    /// The event announcing this order.
    pub fn created_event(&self) -> Event {
        Event::OrderCreated(OrderCreatedData {
            order_id: self.id,
            user_id: self.user_id.clone(),
            items: self.items.clone(),
            total_amount: self.total_amount,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn advanced(&self, status: OrderStatus, now: DateTime<Utc>) -> Order {
        let mut next = self.clone();
        next.status = status;
        next.updated_at = now;
        next.version = self.version.next();
        next
    }

    fn cancelled(&self, reason: &str, now: DateTime<Utc>) -> (Order, Event) {
        let mut next = self.advanced(OrderStatus::Cancelled, now);
        next.cancelled_at = Some(now);
        next.cancellation_reason = Some(reason.to_string());
        let event = Event::OrderCancelled(OrderCancelledData {
            order_id: self.id,
            user_id: self.user_id.clone(),
            reason: reason.to_string(),
        });
        (next, event)
    }

    /// Decides how the order reacts to a saga event. Pure; nothing is saved.
    pub fn react(&self, event: &Event, now: DateTime<Utc>) -> Reaction {
        if self.is_terminal() {
            return Reaction::Ignore {
                reason: "order is terminal",
            };
        }

        match event {
            Event::InventoryReserved(_) if self.status.awaits_inventory() => Reaction::Transition {
                next: self.advanced(OrderStatus::Processing, now),
                emit: None,
            },
            Event::InventoryInsufficient(_) if self.status.awaits_inventory() => {
                let (next, emit) = self.cancelled(INSUFFICIENT_INVENTORY_REASON, now);
                Reaction::Transition {
                    next,
                    emit: Some(emit),
                }
            }
            Event::InventoryReserved(_) | Event::InventoryInsufficient(_) => Reaction::Ignore {
                reason: "inventory outcome already applied",
            },
            Event::PaymentProcessed(_) if self.status.awaits_payment() => {
                let mut next = self.advanced(OrderStatus::Confirmed, now);
                next.confirmed_at = Some(now);
                let emit = Event::OrderConfirmed(OrderConfirmedData {
                    order_id: self.id,
                    user_id: self.user_id.clone(),
                });
                Reaction::Transition {
                    next,
                    emit: Some(emit),
                }
            }
            Event::PaymentFailed(data) if self.status.awaits_payment() => {
                let (next, emit) = self.cancelled(&data.reason, now);
                Reaction::Transition {
                    next,
                    emit: Some(emit),
                }
            }
            Event::PaymentProcessed(_) | Event::PaymentFailed(_) => Reaction::Defer,
            Event::OrderCreated(_)
            | Event::OrderConfirmed(_)
            | Event::OrderCancelled(_)
            | Event::InventoryReleased(_) => Reaction::Ignore {
                reason: "not an order saga input",
            },
        }
    }

    /// Cancels the order on request.
    ///
    /// Returns `None` if the order is already cancelled.
    pub fn cancel(&self, reason: &str, now: DateTime<Utc>) -> Result<Option<(Order, Event)>> {
        match self.status {
            OrderStatus::Cancelled => Ok(None),
            status if status.can_cancel() => Ok(Some(self.cancelled(reason, now))),
            current => Err(OrderError::InvalidStateTransition {
                current,
                action: "cancel",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{PaymentId, ProductId};
    use events::{
        InventoryInsufficientData, InventoryReleasedData, InventoryReservedData,
        PaymentFailedData, PaymentProcessedData, StockItem,
    };

    fn order() -> Order {
        Order::create(
            OrderId::new(),
            UserId::new("u1"),
            vec![OrderLine::new("P1", 2, Money::from_cents(1000))],
            Utc::now(),
        )
        .unwrap()
    }

    fn reserved(o: &Order) -> Event {
        Event::InventoryReserved(InventoryReservedData {
            order_id: o.id,
            items: vec![StockItem::new("P1", 2)],
            total_amount: o.total_amount,
        })
    }

    fn insufficient(o: &Order) -> Event {
        Event::InventoryInsufficient(InventoryInsufficientData {
            order_id: o.id,
            unavailable_items: vec![StockItem::new("P1", 2)],
        })
    }

    fn processed(o: &Order) -> Event {
        Event::PaymentProcessed(PaymentProcessedData {
            order_id: o.id,
            payment_id: PaymentId::new(),
            amount: o.total_amount,
            transaction_id: "txn_000000000001".to_string(),
            payment_method: "credit_card".to_string(),
        })
    }

    fn failed(o: &Order) -> Event {
        Event::PaymentFailed(PaymentFailedData {
            order_id: o.id,
            payment_id: PaymentId::new(),
            user_id: o.user_id.clone(),
            amount: o.total_amount,
            reason: "Insufficient funds".to_string(),
        })
    }

    fn next(reaction: Reaction) -> (Order, Option<Event>) {
        match reaction {
            Reaction::Transition { next, emit } => (next, emit),
            other => panic!("expected transition, got {other:?}"),
        }
    }

    #[test]
    fn test_create_prices_order() {
        let o = order();
        assert_eq!(o.status, OrderStatus::Pending);
        assert_eq!(o.total_amount, Money::from_cents(2000));
        assert_eq!(o.version, Version::first());

        match o.created_event() {
            Event::OrderCreated(data) => {
                assert_eq!(data.items, o.items);
                assert_eq!(data.total_amount, Money::from_cents(2000));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_create_validation() {
        let now = Utc::now();
        let line = |q, cents| OrderLine::new("P1", q, Money::from_cents(cents));

        let cases = [
            (UserId::new(""), vec![line(1, 100)]),
            (UserId::new("u1"), vec![]),
            (UserId::new("u1"), vec![line(0, 100)]),
            (UserId::new("u1"), vec![line(1, -1)]),
            (UserId::new("u1"), vec![OrderLine::new("", 1, Money::zero())]),
            (UserId::new("u1"), vec![line(u32::MAX, i64::MAX)]),
            (UserId::new("u1"), vec![line(1, Money::MAX_CENTS + 1)]),
            (UserId::new("u1"), vec![line(1, Money::MAX_CENTS), line(1, 1)]),
        ];
        for (user_id, items) in cases {
            let result = Order::create(OrderId::new(), user_id, items, now);
            assert!(matches!(result, Err(OrderError::Validation(_))));
        }
    }

    #[test]
    fn test_free_items_are_allowed() {
        let o = Order::create(
            OrderId::new(),
            UserId::new("u1"),
            vec![OrderLine::new(ProductId::new("P1"), 3, Money::zero())],
            Utc::now(),
        )
        .unwrap();
        assert_eq!(o.total_amount, Money::zero());
    }

    #[test]
    fn test_largest_exact_total_is_accepted() {
        let o = Order::create(
            OrderId::new(),
            UserId::new("u1"),
            vec![
                OrderLine::new("P1", 1, Money::from_cents(Money::MAX_CENTS - 1)),
                OrderLine::new("P2", 1, Money::from_cents(1)),
            ],
            Utc::now(),
        )
        .unwrap();
        assert_eq!(o.total_amount.cents(), Money::MAX_CENTS);
    }

    #[test]
    fn test_happy_path_confirms() {
        let o = order();
        let (o, emit) = next(o.react(&reserved(&o), Utc::now()));
        assert_eq!(o.status, OrderStatus::Processing);
        assert!(emit.is_none());

        let (o, emit) = next(o.react(&processed(&o), Utc::now()));
        assert_eq!(o.status, OrderStatus::Confirmed);
        assert!(o.confirmed_at.is_some());
        assert_eq!(o.version, Version::new(3));
        assert!(matches!(emit, Some(Event::OrderConfirmed(_))));
    }

    #[test]
    fn test_insufficient_inventory_cancels() {
        let o = order();
        let (o, emit) = next(o.react(&insufficient(&o), Utc::now()));
        assert_eq!(o.status, OrderStatus::Cancelled);
        assert_eq!(o.cancellation_reason.as_deref(), Some("insufficient inventory"));
        match emit {
            Some(Event::OrderCancelled(data)) => assert_eq!(data.reason, "insufficient inventory"),
            other => panic!("unexpected emit {other:?}"),
        }
    }

    #[test]
    fn test_payment_failure_cancels_with_payment_reason() {
        let o = order();
        let (o, _) = next(o.react(&reserved(&o), Utc::now()));
        let (o, emit) = next(o.react(&failed(&o), Utc::now()));
        assert_eq!(o.status, OrderStatus::Cancelled);
        assert!(matches!(emit, Some(Event::OrderCancelled(d)) if d.reason == "Insufficient funds"));
    }

    #[test]
    fn test_duplicate_inventory_outcome_is_ignored() {
        let o = order();
        let (o, _) = next(o.react(&reserved(&o), Utc::now()));
        assert!(matches!(o.react(&reserved(&o), Utc::now()), Reaction::Ignore { .. }));
        assert!(matches!(o.react(&insufficient(&o), Utc::now()), Reaction::Ignore { .. }));
    }

    #[test]
    fn test_terminal_order_ignores_everything() {
        let o = order();
        let (o, _) = next(o.react(&insufficient(&o), Utc::now()));
        for event in [reserved(&o), insufficient(&o), processed(&o), failed(&o)] {
            assert!(matches!(o.react(&event, Utc::now()), Reaction::Ignore { .. }));
        }
    }

    #[test]
    fn test_payment_before_reservation_is_deferred() {
        let o = order();
        assert_eq!(o.react(&processed(&o), Utc::now()), Reaction::Defer);
        assert_eq!(o.react(&failed(&o), Utc::now()), Reaction::Defer);
    }

    #[test]
    fn test_release_event_is_not_an_input() {
        let o = order();
        let released = Event::InventoryReleased(InventoryReleasedData {
            order_id: o.id,
            items: vec![],
            reason: "x".to_string(),
        });
        assert!(matches!(o.react(&released, Utc::now()), Reaction::Ignore { .. }));
    }

    #[test]
    fn test_cancel_rules() {
        let o = order();
        let (cancelled, event) = o.cancel("changed mind", Utc::now()).unwrap().unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert!(matches!(event, Event::OrderCancelled(_)));

        assert!(cancelled.cancel("again", Utc::now()).unwrap().is_none());

        let (processing, _) = next(o.react(&reserved(&o), Utc::now()));
        let (confirmed, _) = next(processing.react(&processed(&processing), Utc::now()));
        assert!(processing.cancel("late", Utc::now()).unwrap().is_some());
        assert!(matches!(
            confirmed.cancel("too late", Utc::now()),
            Err(OrderError::InvalidStateTransition {
                current: OrderStatus::Confirmed,
                ..
            })
        ));
    }
}
