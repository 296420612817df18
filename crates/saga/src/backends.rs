//! Storage backends of the three services.

use std::sync::Arc;
use std::time::Duration;

use inventory::{InMemoryInventoryStore, InventoryStore, PostgresInventoryStore};
use order::{InMemoryOrderStore, OrderStore, PostgresOrderStore};
use payment::{InMemoryPaymentStore, PaymentStore, PostgresPaymentStore};
use sqlx::PgPool;
use transport::{InMemoryOutbox, Outbox, PostgresOutbox};

/// Each service's store and the outbox its relay drains.
///
/// A store and its outbox must share a backend so state changes and events
/// commit together.
#[derive(Clone)]
pub struct Backends {
    pub orders: Arc<dyn OrderStore>,
    pub order_outbox: Arc<dyn Outbox>,
    pub inventory: Arc<dyn InventoryStore>,
    pub inventory_outbox: Arc<dyn Outbox>,
    pub payments: Arc<dyn PaymentStore>,
    pub payment_outbox: Arc<dyn Outbox>,
}

impl Backends {
    /// Process-local stores, one outbox per service.
    pub fn in_memory(lock_timeout: Duration) -> Self {
        let order_outbox = InMemoryOutbox::new();
        let inventory_outbox = InMemoryOutbox::new();
        let payment_outbox = InMemoryOutbox::new();

        Self {
            orders: Arc::new(InMemoryOrderStore::new(order_outbox.clone())),
            order_outbox: Arc::new(order_outbox),
            inventory: Arc::new(
                InMemoryInventoryStore::new(inventory_outbox.clone()).with_lock_timeout(lock_timeout),
            ),
            inventory_outbox: Arc::new(inventory_outbox),
            payments: Arc::new(InMemoryPaymentStore::new(payment_outbox.clone())),
            payment_outbox: Arc::new(payment_outbox),
        }
    }

    /// PostgreSQL stores sharing one pool; the outbox table is partitioned
    /// by producer name.
    pub fn postgres(pool: PgPool, lock_timeout: Duration) -> Self {
        Self {
            orders: Arc::new(PostgresOrderStore::new(pool.clone())),
            order_outbox: Arc::new(PostgresOutbox::new(pool.clone(), order::PRODUCER)),
            inventory: Arc::new(
                PostgresInventoryStore::new(pool.clone()).with_lock_timeout(lock_timeout),
            ),
            inventory_outbox: Arc::new(PostgresOutbox::new(pool.clone(), inventory::PRODUCER)),
            payments: Arc::new(PostgresPaymentStore::new(pool.clone())),
            payment_outbox: Arc::new(PostgresOutbox::new(pool, payment::PRODUCER)),
        }
    }
}
