use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::{OrderId, PaymentId, Version};
use events::EventEnvelope;
use tokio::sync::RwLock;
use transport::InMemoryOutbox;

use crate::model::Payment;
use crate::store::PaymentStore;
use crate::{PaymentError, Result};

#[derive(Debug, Default)]
struct PaymentState {
    payments: HashMap<PaymentId, Payment>,
    by_order: HashMap<OrderId, PaymentId>,
}

/// In-memory payment store sharing an outbox with the relay.
#[derive(Debug, Clone)]
pub struct InMemoryPaymentStore {
    state: Arc<RwLock<PaymentState>>,
    outbox: InMemoryOutbox,
}

impl InMemoryPaymentStore {
    pub fn new(outbox: InMemoryOutbox) -> Self {
        Self {
            state: Arc::new(RwLock::new(PaymentState::default())),
            outbox,
        }
    }

    pub fn outbox(&self) -> &InMemoryOutbox {
        &self.outbox
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.payments.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for InMemoryPaymentStore {
    fn default() -> Self {
        Self::new(InMemoryOutbox::new())
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn get(&self, id: PaymentId) -> Result<Option<Payment>> {
        Ok(self.state.read().await.payments.get(&id).cloned())
    }

    async fn find_by_order(&self, order_id: OrderId) -> Result<Option<Payment>> {
        let state = self.state.read().await;
        Ok(state
            .by_order
            .get(&order_id)
            .and_then(|id| state.payments.get(id))
            .cloned())
    }

    async fn insert_if_absent(&self, payment: &Payment) -> Result<Payment> {
        let mut state = self.state.write().await;
        if let Some(existing) = state
            .by_order
            .get(&payment.order_id)
            .and_then(|id| state.payments.get(id))
        {
            return Ok(existing.clone());
        }

        state.by_order.insert(payment.order_id, payment.id);
        state.payments.insert(payment.id, payment.clone());
        Ok(payment.clone())
    }

    async fn save(&self, payment: &Payment, expected: Version, event: EventEnvelope) -> Result<()> {
        let mut state = self.state.write().await;
        let current = state
            .payments
            .get_mut(&payment.id)
            .ok_or(PaymentError::NotFound(payment.id))?;

        if current.version != expected {
            return Err(PaymentError::ConcurrencyConflict(format!(
                "payment {} is at version {}, expected {}",
                payment.id, current.version, expected
            )));
        }

        *current = payment.clone();
        self.outbox.push(event);
        Ok(())
    }
}
