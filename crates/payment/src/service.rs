use std::sync::Arc;

use common::{Clock, CorrelationId, Money, OrderId, PaymentId, UserId};
use events::{
    DEFAULT_PAYMENT_METHOD, Event, EventEnvelope, PaymentFailedData, PaymentProcessedData,
};

use crate::model::{Payment, PaymentOutcome};
use crate::settlement::{Decision, SettlementDecider};
use crate::store::PaymentStore;
use crate::{PaymentError, Result};

/// Settles payments, at most once per order.
pub struct PaymentService {
    store: Arc<dyn PaymentStore>,
    decider: Arc<dyn SettlementDecider>,
    clock: Arc<dyn Clock>,
}

impl PaymentService {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        decider: Arc<dyn SettlementDecider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            decider,
            clock,
        }
    }

    /// Settles the payment of an order with the default payment method.
    pub async fn process(
        &self,
        order_id: OrderId,
        user_id: UserId,
        amount: Money,
        correlation_id: &CorrelationId,
    ) -> Result<PaymentOutcome> {
        self.process_with_method(order_id, user_id, amount, DEFAULT_PAYMENT_METHOD, correlation_id)
            .await
    }

    /// Settles the payment of an order.
    ///
    /// A terminal payment for the order is returned as recorded, without a
    /// new decision or event. Otherwise the processing attempt is reused or
    /// created, decided once, and saved together with its event. If a
    /// concurrent attempt saves first this fails with
    /// [`PaymentError::ConcurrencyConflict`] and records nothing.
    #[tracing::instrument(
        skip(self, user_id, correlation_id),
        fields(order_id = %order_id, amount = %amount, correlation_id = %correlation_id)
    )]
    pub async fn process_with_method(
        &self,
        order_id: OrderId,
        user_id: UserId,
        amount: Money,
        payment_method: &str,
        correlation_id: &CorrelationId,
    ) -> Result<PaymentOutcome> {
        if !amount.is_positive() {
            return Err(PaymentError::Validation(format!(
                "payment amount must be positive, got {amount}"
            )));
        }
        if user_id.is_blank() {
            return Err(PaymentError::Validation("user id must not be empty".to_string()));
        }
        if payment_method.trim().is_empty() {
            return Err(PaymentError::Validation(
                "payment method must not be empty".to_string(),
            ));
        }

        if let Some(outcome) = self
            .store
            .find_by_order(order_id)
            .await?
            .and_then(|p| p.outcome())
        {
            tracing::debug!(outcome = outcome.as_str(), "Payment already settled");
            metrics::counter!("payments_replayed_total").increment(1);
            return Ok(outcome);
        }

        let candidate = Payment::processing(order_id, user_id, amount, self.clock.now())
            .with_payment_method(payment_method);
        let stored = self.store.insert_if_absent(&candidate).await?;
        // A concurrent attempt may have settled between the lookup and the insert.
        if let Some(outcome) = stored.outcome() {
            metrics::counter!("payments_replayed_total").increment(1);
            return Ok(outcome);
        }

        let expected = stored.version;
        let mut payment = stored;
        let now = self.clock.now();
        let event = match self.decider.decide(&payment) {
            Decision::Approved { transaction_id } => {
                payment.complete(transaction_id.clone(), now);
                Event::PaymentProcessed(PaymentProcessedData {
                    order_id,
                    payment_id: payment.id,
                    amount: payment.amount,
                    transaction_id,
                    payment_method: payment.payment_method.clone(),
                })
            }
            Decision::Declined { reason } => {
                payment.fail(reason.clone(), now);
                Event::PaymentFailed(PaymentFailedData {
                    order_id,
                    payment_id: payment.id,
                    user_id: payment.user_id.clone(),
                    amount: payment.amount,
                    reason,
                })
            }
        };

        let envelope = EventEnvelope::new(event)
            .with_timestamp(now)
            .with_correlation_id(correlation_id.clone());
        self.store.save(&payment, expected, envelope).await?;

        let outcome = payment.outcome().ok_or_else(|| {
            PaymentError::Corrupt(format!("payment {} saved without outcome", payment.id))
        })?;
        metrics::counter!("payments_settled_total", "outcome" => outcome.as_str()).increment(1);
        tracing::info!(
            payment_id = %payment.id,
            outcome = outcome.as_str(),
            "Payment settled"
        );
        Ok(outcome)
    }

    pub async fn get_payment(&self, id: PaymentId) -> Result<Payment> {
        self.store
            .get(id)
            .await?
            .ok_or(PaymentError::NotFound(id))
    }

    pub async fn payment_for_order(&self, order_id: OrderId) -> Result<Option<Payment>> {
        self.store.find_by_order(order_id).await
    }
}
