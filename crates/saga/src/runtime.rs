//! Composition root of the saga.

use std::sync::Arc;

use common::{Clock, OrderId, SystemClock};
use events::DEFAULT_PAYMENT_METHOD;
use inventory::{InventoryHandler, InventoryService};
use order::{OrderError, OrderHandler, OrderService, OrderStatus};
use payment::{PaymentOutcome, PaymentService, RandomSettlement, SettlementDecider};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use transport::{Consumer, MessageHandler, Outbox, OutboxRelay, QueueSpec, Transport};

use crate::backends::Backends;
use crate::config::SagaConfig;
use crate::error::Result;

/// Configures and starts a [`SagaRuntime`].
pub struct SagaRuntimeBuilder {
    config: SagaConfig,
    backends: Option<Backends>,
    clock: Arc<dyn Clock>,
    decider: Option<Arc<dyn SettlementDecider>>,
}

impl SagaRuntimeBuilder {
    /// Storage for the three services. Defaults to in-memory stores.
    pub fn backends(mut self, backends: Backends) -> Self {
        self.backends = Some(backends);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Payment gateway. Defaults to a [`RandomSettlement`] built from the
    /// configured probability and seed.
    pub fn decider(mut self, decider: Arc<dyn SettlementDecider>) -> Self {
        self.decider = Some(decider);
        self
    }

    /// Declares every queue, then starts the consumers and outbox relays.
    ///
    /// Queues are declared before any relay runs so no event is published
    /// to an exchange without its bindings.
    #[tracing::instrument(skip_all, fields(exchange = %transport.exchange()))]
    pub async fn start(self, transport: Arc<dyn Transport>) -> Result<SagaRuntime> {
        let config = self.config;
        let backends = self
            .backends
            .unwrap_or_else(|| Backends::in_memory(config.lock_timeout));
        let decider = self.decider.unwrap_or_else(|| {
            Arc::new(match config.payment_seed {
                Some(seed) => RandomSettlement::seeded(config.payment_success_probability, seed),
                None => RandomSettlement::new(config.payment_success_probability),
            })
        });

        let orders = Arc::new(OrderService::new(backends.orders, Arc::clone(&self.clock)));
        let inventory = Arc::new(InventoryService::new(backends.inventory, Arc::clone(&self.clock)));
        let payments = Arc::new(PaymentService::new(backends.payments, decider, self.clock));

        let inventory_handler: Arc<dyn MessageHandler> =
            Arc::new(InventoryHandler::new(Arc::clone(&inventory)));
        let order_handler: Arc<dyn MessageHandler> = Arc::new(OrderHandler::new(Arc::clone(&orders)));

        let queues: [(QueueSpec, &Arc<dyn MessageHandler>); 3] = [
            (InventoryHandler::queue_spec(), &inventory_handler),
            (OrderHandler::inventory_queue_spec(), &order_handler),
            (OrderHandler::payment_queue_spec(), &order_handler),
        ];

        let mut subscriptions = Vec::with_capacity(queues.len());
        for (spec, handler) in queues {
            let subscription = transport.declare_queue(config.queue(spec)).await?;
            subscriptions.push((subscription, Arc::clone(handler)));
        }

        let (shutdown, shutdown_rx) = watch::channel(false);

        let consumers = subscriptions
            .into_iter()
            .map(|(subscription, handler)| {
                Consumer::new(subscription, handler)
                    .with_retry_backoff(config.retry_backoff)
                    .spawn(shutdown_rx.clone())
            })
            .collect();

        let outboxes: [(&str, Arc<dyn Outbox>); 3] = [
            (order::PRODUCER, backends.order_outbox),
            (inventory::PRODUCER, backends.inventory_outbox),
            (payment::PRODUCER, backends.payment_outbox),
        ];
        let relays = outboxes
            .into_iter()
            .map(|(name, outbox)| {
                let relay = OutboxRelay::new(name, outbox, Arc::clone(&transport))
                    .with_batch_size(config.outbox_batch_size)
                    .with_poll_interval(config.outbox_poll_interval);
                tokio::spawn(relay.run(shutdown_rx.clone()))
            })
            .collect();

        tracing::info!("Saga runtime started");
        Ok(SagaRuntime {
            orders,
            inventory,
            payments,
            transport,
            shutdown,
            consumers,
            relays,
        })
    }
}

/// The three services, their consumers and their outbox relays.
///
/// Dropping the runtime without [`shutdown`](Self::shutdown) also stops the
/// background tasks, but does not wait for them.
pub struct SagaRuntime {
    orders: Arc<OrderService>,
    inventory: Arc<InventoryService>,
    payments: Arc<PaymentService>,
    transport: Arc<dyn Transport>,
    shutdown: watch::Sender<bool>,
    consumers: Vec<JoinHandle<transport::Result<()>>>,
    relays: Vec<JoinHandle<()>>,
}

impl SagaRuntime {
    pub fn builder(config: SagaConfig) -> SagaRuntimeBuilder {
        SagaRuntimeBuilder {
            config,
            backends: None,
            clock: Arc::new(SystemClock),
            decider: None,
        }
    }

    pub fn orders(&self) -> &Arc<OrderService> {
        &self.orders
    }

    pub fn inventory(&self) -> &Arc<InventoryService> {
        &self.inventory
    }

    pub fn payments(&self) -> &Arc<PaymentService> {
        &self.payments
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Settles the payment of an order whose stock is reserved.
    ///
    /// This is the external payment trigger: it charges the order's user for
    /// the order's total. Repeating it returns the settled outcome, even once
    /// the order has moved on. Otherwise orders that are not `Processing`
    /// are refused.
    pub async fn pay_order(&self, order_id: OrderId) -> Result<PaymentOutcome> {
        self.pay_order_with_method(order_id, DEFAULT_PAYMENT_METHOD)
            .await
    }

    /// Like [`SagaRuntime::pay_order`], naming how the user pays. A repeated
    /// call returns the settled outcome whatever method it names.
    #[tracing::instrument(skip(self))]
    pub async fn pay_order_with_method(
        &self,
        order_id: OrderId,
        payment_method: &str,
    ) -> Result<PaymentOutcome> {
        let order = self.orders.get_order(order_id).await?;
        if let Some(outcome) = self
            .payments
            .payment_for_order(order_id)
            .await?
            .and_then(|payment| payment.outcome())
        {
            tracing::debug!(%order_id, "Payment already settled");
            return Ok(outcome);
        }
        if order.status != OrderStatus::Processing {
            return Err(OrderError::InvalidStateTransition {
                current: order.status,
                action: "pay",
            }
            .into());
        }

        let outcome = self
            .payments
            .process_with_method(
                order.id,
                order.user_id,
                order.total_amount,
                payment_method,
                &order.id.into(),
            )
            .await?;
        Ok(outcome)
    }

    /// Stops the consumers and relays and waits for them. In-flight
    /// handlers finish and committed outbox rows are flushed first.
    pub async fn shutdown(self) -> Result<()> {
        tracing::info!("Saga runtime stopping");
        let _ = self.shutdown.send(true);

        let mut first_error = None;
        for consumer in self.consumers {
            match consumer.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "Consumer failed");
                    first_error.get_or_insert(e.into());
                }
                Err(e) => {
                    tracing::error!(error = %e, "Consumer task failed");
                    first_error.get_or_insert(e.into());
                }
            }
        }
        for relay in self.relays {
            if let Err(e) = relay.await {
                tracing::error!(error = %e, "Relay task failed");
                first_error.get_or_insert(e.into());
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
