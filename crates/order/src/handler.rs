use std::sync::Arc;

use async_trait::async_trait;
use events::{EventEnvelope, EventType};
use transport::{HandlerError, MessageHandler, QueueSpec};

use crate::OrderError;
use crate::service::{EventOutcome, OrderService};

/// Queue the order service consumes inventory outcomes from.
pub const INVENTORY_QUEUE: &str = "order_service.inventory";

/// Queue the order service consumes payment outcomes from.
pub const PAYMENT_QUEUE: &str = "order_service.payment";

/// Drives orders from inventory and payment events.
pub struct OrderHandler {
    service: Arc<OrderService>,
}

impl OrderHandler {
    pub fn new(service: Arc<OrderService>) -> Self {
        Self { service }
    }

    pub fn inventory_queue_spec() -> QueueSpec {
        QueueSpec::new(INVENTORY_QUEUE)
            .bind(EventType::InventoryReserved.as_str())
            .bind(EventType::InventoryInsufficient.as_str())
    }

    pub fn payment_queue_spec() -> QueueSpec {
        QueueSpec::new(PAYMENT_QUEUE)
            .bind(EventType::PaymentProcessed.as_str())
            .bind(EventType::PaymentFailed.as_str())
    }
}

fn to_handler_error(e: OrderError) -> HandlerError {
    if e.is_transient() {
        HandlerError::Transient(e.to_string())
    } else {
        HandlerError::Rejected(e.to_string())
    }
}

#[async_trait]
impl MessageHandler for OrderHandler {
    fn name(&self) -> &str {
        "order"
    }

    async fn handle(&self, envelope: EventEnvelope) -> Result<(), HandlerError> {
        match self.service.apply_event(&envelope).await {
            Ok(EventOutcome::Applied(_) | EventOutcome::Ignored) => Ok(()),
            Ok(EventOutcome::Deferred) => Err(HandlerError::Transient(format!(
                "order {} is not ready for {}",
                envelope.payload.order_id(),
                envelope.event_type()
            ))),
            Err(e) => Err(to_handler_error(e)),
        }
    }
}
