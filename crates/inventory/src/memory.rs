use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use common::{OrderId, ProductId, ReservationId};
use events::EventEnvelope;
use tokio::sync::{OwnedMutexGuard, RwLock};
use transport::InMemoryOutbox;

use crate::model::{Product, Reservation};
use crate::store::{InventoryStore, InventoryTx};
use crate::{InventoryError, Result};

#[derive(Debug, Default)]
struct InventoryState {
    products: BTreeMap<ProductId, Product>,
    reservations: BTreeMap<ReservationId, Reservation>,
    released_orders: HashSet<OrderId>,
}

/// Named async mutexes. An entry lives while a transaction holds or waits
/// for it and is removed once the last one lets go.
#[derive(Debug, Default)]
struct LockTable {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LockTable {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.entries().entry(key.to_string()).or_default())
    }

    /// Drops the entry for `key` if only the table still refers to it.
    fn release(&self, key: &str) {
        let mut locks = self.entries();
        if locks.get(key).is_some_and(|handle| Arc::strong_count(handle) == 1) {
            locks.remove(key);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries().len()
    }
}

/// A held lock. Dropping it unlocks and prunes the table entry.
#[derive(Debug)]
struct LockGuard {
    table: Arc<LockTable>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.table.release(&self.key);
    }
}

fn product_key(id: &ProductId) -> String {
    format!("product:{id}")
}

fn order_key(id: OrderId) -> String {
    format!("order:{id}")
}

/// In-memory inventory store.
///
/// Row locks are emulated with one async mutex per product (and per order);
/// staged changes and outbox events are applied together under the state
/// write lock on commit.
#[derive(Debug, Clone)]
pub struct InMemoryInventoryStore {
    state: Arc<RwLock<InventoryState>>,
    locks: Arc<LockTable>,
    outbox: InMemoryOutbox,
    lock_timeout: Duration,
}

impl InMemoryInventoryStore {
    pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(outbox: InMemoryOutbox) -> Self {
        Self {
            state: Arc::new(RwLock::new(InventoryState::default())),
            locks: Arc::new(LockTable::default()),
            outbox,
            lock_timeout: Self::DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn outbox(&self) -> &InMemoryOutbox {
        &self.outbox
    }
}

impl Default for InMemoryInventoryStore {
    fn default() -> Self {
        Self::new(InMemoryOutbox::new())
    }
}

#[async_trait]
impl InventoryStore for InMemoryInventoryStore {
    async fn begin(&self) -> Result<Box<dyn InventoryTx>> {
        Ok(Box::new(InMemoryInventoryTx {
            store: self.clone(),
            guards: HashMap::new(),
            products: BTreeMap::new(),
            new_products: BTreeMap::new(),
            reservations: BTreeMap::new(),
            released_orders: HashSet::new(),
            events: Vec::new(),
        }))
    }

    async fn get_product(&self, id: &ProductId) -> Result<Option<Product>> {
        Ok(self.state.read().await.products.get(id).cloned())
    }

    async fn list_products(&self) -> Result<Vec<Product>> {
        Ok(self.state.read().await.products.values().cloned().collect())
    }

    async fn reservations_for_order(&self, order_id: OrderId) -> Result<Vec<Reservation>> {
        let state = self.state.read().await;
        let mut reservations: Vec<Reservation> = state
            .reservations
            .values()
            .filter(|r| r.order_id == order_id)
            .cloned()
            .collect();
        reservations.sort_by(|a, b| a.product_id.cmp(&b.product_id));
        Ok(reservations)
    }
}

struct InMemoryInventoryTx {
    store: InMemoryInventoryStore,
    guards: HashMap<String, LockGuard>,
    products: BTreeMap<ProductId, Product>,
    new_products: BTreeMap<ProductId, Product>,
    reservations: BTreeMap<ReservationId, Reservation>,
    released_orders: HashSet<OrderId>,
    events: Vec<EventEnvelope>,
}

impl InMemoryInventoryTx {
    async fn acquire(&mut self, key: String) -> Result<()> {
        if self.guards.contains_key(&key) {
            return Ok(());
        }

        let table = Arc::clone(&self.store.locks);
        let handle = table.handle(&key);
        let Ok(guard) = tokio::time::timeout(self.store.lock_timeout, handle.lock_owned()).await
        else {
            table.release(&key);
            return Err(InventoryError::ConcurrencyConflict(format!(
                "timed out waiting for lock on {key}"
            )));
        };
        self.guards.insert(
            key.clone(),
            LockGuard {
                table,
                key,
                guard: Some(guard),
            },
        );
        Ok(())
    }

    fn ensure_locked(&self, id: &ProductId) -> Result<()> {
        if self.guards.contains_key(&product_key(id)) || self.new_products.contains_key(id) {
            Ok(())
        } else {
            Err(InventoryError::Corrupt(format!("product {id} written without its lock")))
        }
    }
}

#[async_trait]
impl InventoryTx for InMemoryInventoryTx {
    async fn lock_order(&mut self, order_id: OrderId) -> Result<()> {
        self.acquire(order_key(order_id)).await
    }

    async fn lock_product(&mut self, id: &ProductId) -> Result<Option<Product>> {
        if let Some(product) = self.new_products.get(id) {
            return Ok(Some(product.clone()));
        }
        if !self.store.state.read().await.products.contains_key(id) {
            return Ok(None);
        }

        self.acquire(product_key(id)).await?;

        if let Some(product) = self.products.get(id) {
            return Ok(Some(product.clone()));
        }
        Ok(self.store.state.read().await.products.get(id).cloned())
    }

    async fn reservations_for_order(&mut self, order_id: OrderId) -> Result<Vec<Reservation>> {
        let state = self.store.state.read().await;
        let mut merged: BTreeMap<ReservationId, Reservation> = state
            .reservations
            .iter()
            .filter(|(_, r)| r.order_id == order_id)
            .map(|(id, r)| (*id, r.clone()))
            .collect();
        for (id, r) in self.reservations.iter().filter(|(_, r)| r.order_id == order_id) {
            merged.insert(*id, r.clone());
        }

        let mut reservations: Vec<Reservation> = merged.into_values().collect();
        reservations.sort_by(|a, b| a.product_id.cmp(&b.product_id));
        Ok(reservations)
    }

    async fn is_order_released(&mut self, order_id: OrderId) -> Result<bool> {
        if self.released_orders.contains(&order_id) {
            return Ok(true);
        }
        Ok(self.store.state.read().await.released_orders.contains(&order_id))
    }

    async fn mark_order_released(&mut self, order_id: OrderId) -> Result<()> {
        self.released_orders.insert(order_id);
        Ok(())
    }

    async fn insert_product(&mut self, product: &Product) -> Result<()> {
        if self.new_products.contains_key(&product.id)
            || self.store.state.read().await.products.contains_key(&product.id)
        {
            return Err(InventoryError::ProductAlreadyExists(product.id.clone()));
        }
        self.new_products.insert(product.id.clone(), product.clone());
        Ok(())
    }

    async fn update_product(&mut self, product: &Product) -> Result<()> {
        self.ensure_locked(&product.id)?;
        if let Some(staged) = self.new_products.get_mut(&product.id) {
            *staged = product.clone();
        } else {
            self.products.insert(product.id.clone(), product.clone());
        }
        Ok(())
    }

    async fn insert_reservation(&mut self, reservation: &Reservation) -> Result<()> {
        self.reservations.insert(reservation.id, reservation.clone());
        Ok(())
    }

    async fn update_reservation(&mut self, reservation: &Reservation) -> Result<()> {
        self.reservations.insert(reservation.id, reservation.clone());
        Ok(())
    }

    async fn enqueue(&mut self, envelope: EventEnvelope) -> Result<()> {
        self.events.push(envelope);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let tx = *self;
        let mut state = tx.store.state.write().await;

        if let Some(id) = tx
            .new_products
            .keys()
            .find(|id| state.products.contains_key(*id))
        {
            return Err(InventoryError::ProductAlreadyExists(id.clone()));
        }

        state.products.extend(tx.new_products);
        state.products.extend(tx.products);
        state.reservations.extend(tx.reservations);
        state.released_orders.extend(tx.released_orders);
        tx.store.outbox.push_all(tx.events);

        // Locks are released when `tx.guards` drops, after the state is visible.
        drop(state);
        drop(tx.guards);
        Ok(())
    }
}
