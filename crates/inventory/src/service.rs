use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use common::{Clock, CorrelationId, Money, OrderId, ProductId};
use events::{
    Event, EventEnvelope, InventoryInsufficientData, InventoryReleasedData, InventoryReservedData,
    StockItem,
};

use crate::model::{Product, ReleaseOutcome, ReserveOutcome, Reservation};
use crate::store::InventoryStore;
use crate::{InventoryError, Result};

/// Inventory operations. Every state change and its event commit together.
pub struct InventoryService {
    store: Arc<dyn InventoryStore>,
    clock: Arc<dyn Clock>,
}

impl InventoryService {
    pub fn new(store: Arc<dyn InventoryStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    fn envelope(&self, event: Event, correlation_id: &CorrelationId) -> EventEnvelope {
        EventEnvelope::new(event)
            .with_timestamp(self.clock.now())
            .with_correlation_id(correlation_id.clone())
    }

    /// Reserves stock for every item of an order, or none of it.
    ///
    /// Replays for an order that already holds reservations change nothing.
    /// Products are locked in ascending id order so concurrent multi-item
    /// reservations cannot deadlock.
    #[tracing::instrument(
        skip(self, items, total_amount, correlation_id),
        fields(order_id = %order_id, correlation_id = %correlation_id)
    )]
    pub async fn reserve(
        &self,
        order_id: OrderId,
        items: &[StockItem],
        total_amount: Money,
        correlation_id: &CorrelationId,
    ) -> Result<ReserveOutcome> {
        let start = Instant::now();
        let requested = merge_items(items)?;

        if !self.store.reservations_for_order(order_id).await?.is_empty() {
            tracing::debug!("Order already reserved");
            return Ok(record_reserve(ReserveOutcome::AlreadyReserved, start));
        }

        let mut tx = self.store.begin().await?;
        tx.lock_order(order_id).await?;

        // A concurrent duplicate may have committed between the check above
        // and taking the lock.
        if !tx.reservations_for_order(order_id).await?.is_empty() {
            tracing::debug!("Order reserved concurrently");
            return Ok(record_reserve(ReserveOutcome::AlreadyReserved, start));
        }
        if tx.is_order_released(order_id).await? {
            tracing::info!("Order released before reservation, skipping");
            return Ok(record_reserve(ReserveOutcome::OrderReleased, start));
        }

        let mut locked = Vec::with_capacity(requested.len());
        let mut unavailable = Vec::new();
        for (product_id, quantity) in requested {
            match tx.lock_product(&product_id).await? {
                Some(product) if product.can_reserve(quantity) => locked.push((product, quantity)),
                Some(product) => {
                    tracing::debug!(
                        product_id = %product_id,
                        requested = quantity,
                        available = product.available_quantity(),
                        "Insufficient stock"
                    );
                    unavailable.push(StockItem::new(product_id, quantity));
                }
                None => {
                    tracing::debug!(product_id = %product_id, "Unknown product");
                    unavailable.push(StockItem::new(product_id, quantity));
                }
            }
        }

        if !unavailable.is_empty() {
            // Nothing was staged; only the event is written.
            let event = Event::InventoryInsufficient(InventoryInsufficientData {
                order_id,
                unavailable_items: unavailable.clone(),
            });
            tx.enqueue(self.envelope(event, correlation_id)).await?;
            tx.commit().await?;

            tracing::info!(unavailable = unavailable.len(), "Reservation refused");
            return Ok(record_reserve(
                ReserveOutcome::Insufficient {
                    unavailable_items: unavailable,
                },
                start,
            ));
        }

        let now = self.clock.now();
        let mut reserved = Vec::with_capacity(locked.len());
        for (mut product, quantity) in locked {
            product.reserve(quantity, now)?;
            tx.update_product(&product).await?;
            tx.insert_reservation(&Reservation::new(order_id, product.id.clone(), quantity, now))
                .await?;
            reserved.push(StockItem::new(product.id, quantity));
        }

        let event = Event::InventoryReserved(InventoryReservedData {
            order_id,
            items: reserved.clone(),
            total_amount,
        });
        tx.enqueue(self.envelope(event, correlation_id)).await?;
        tx.commit().await?;

        tracing::info!(items = reserved.len(), "Inventory reserved");
        Ok(record_reserve(ReserveOutcome::Reserved { items: reserved }, start))
    }

    /// Releases every outstanding reservation of an order.
    ///
    /// With nothing outstanding this changes no stock and records no event,
    /// but remembers the release so a late reservation for the order is
    /// skipped.
    #[tracing::instrument(
        skip(self, reason, correlation_id),
        fields(order_id = %order_id, correlation_id = %correlation_id)
    )]
    pub async fn release(
        &self,
        order_id: OrderId,
        reason: &str,
        correlation_id: &CorrelationId,
    ) -> Result<ReleaseOutcome> {
        let mut tx = self.store.begin().await?;
        tx.lock_order(order_id).await?;

        let outstanding: Vec<Reservation> = tx
            .reservations_for_order(order_id)
            .await?
            .into_iter()
            .filter(|r| !r.is_released)
            .collect();

        tx.mark_order_released(order_id).await?;

        if outstanding.is_empty() {
            tx.commit().await?;
            tracing::debug!("Nothing to release");
            metrics::counter!("inventory_releases_total", "outcome" => "nothing_to_release")
                .increment(1);
            return Ok(ReleaseOutcome::NothingToRelease);
        }

        let now = self.clock.now();
        let mut released = Vec::with_capacity(outstanding.len());
        // Reservations come back sorted by product id, which is the lock order.
        for mut reservation in outstanding {
            let mut product = tx
                .lock_product(&reservation.product_id)
                .await?
                .ok_or_else(|| {
                    InventoryError::Corrupt(format!(
                        "reservation {} references missing product {}",
                        reservation.id, reservation.product_id
                    ))
                })?;
            product.release(reservation.quantity, now)?;
            tx.update_product(&product).await?;

            reservation.mark_released(now);
            tx.update_reservation(&reservation).await?;
            released.push(StockItem::new(reservation.product_id, reservation.quantity));
        }

        let event = Event::InventoryReleased(InventoryReleasedData {
            order_id,
            items: released.clone(),
            reason: reason.to_string(),
        });
        tx.enqueue(self.envelope(event, correlation_id)).await?;
        tx.commit().await?;

        tracing::info!(items = released.len(), reason, "Inventory released");
        metrics::counter!("inventory_releases_total", "outcome" => "released").increment(1);
        Ok(ReleaseOutcome::Released { items: released })
    }

    /// Creates a product with initial stock.
    #[tracing::instrument(skip(self, name))]
    pub async fn create_product(
        &self,
        id: ProductId,
        name: &str,
        stock_quantity: u32,
    ) -> Result<Product> {
        if id.is_blank() {
            return Err(InventoryError::Validation("product id must not be empty".to_string()));
        }
        if name.trim().is_empty() {
            return Err(InventoryError::Validation("product name must not be empty".to_string()));
        }

        let product = Product::new(id, name.trim(), stock_quantity, self.clock.now());
        let mut tx = self.store.begin().await?;
        tx.insert_product(&product).await?;
        tx.commit().await?;

        tracing::info!(stock = stock_quantity, "Product created");
        Ok(product)
    }

    /// Adds stock to an existing product.
    #[tracing::instrument(skip(self))]
    pub async fn add_stock(&self, id: &ProductId, quantity: u32) -> Result<Product> {
        if quantity == 0 {
            return Err(InventoryError::Validation("quantity must be positive".to_string()));
        }

        let mut tx = self.store.begin().await?;
        let mut product = tx
            .lock_product(id)
            .await?
            .ok_or_else(|| InventoryError::ProductNotFound(id.clone()))?;
        product.add_stock(quantity, self.clock.now())?;
        tx.update_product(&product).await?;
        tx.commit().await?;

        tracing::info!(stock = product.stock_quantity, "Stock added");
        Ok(product)
    }

    pub async fn get_product(&self, id: &ProductId) -> Result<Product> {
        self.store
            .get_product(id)
            .await?
            .ok_or_else(|| InventoryError::ProductNotFound(id.clone()))
    }

    pub async fn list_products(&self) -> Result<Vec<Product>> {
        self.store.list_products().await
    }

    pub async fn reservations_for_order(&self, order_id: OrderId) -> Result<Vec<Reservation>> {
        self.store.reservations_for_order(order_id).await
    }
}

/// Merges duplicate product lines and orders them by product id, which is
/// also the lock acquisition order.
fn merge_items(items: &[StockItem]) -> Result<BTreeMap<ProductId, u32>> {
    if items.is_empty() {
        return Err(InventoryError::Validation("no items to reserve".to_string()));
    }

    let mut merged = BTreeMap::new();
    for item in items {
        if item.product_id.is_blank() {
            return Err(InventoryError::Validation("product id must not be empty".to_string()));
        }
        if item.quantity == 0 {
            return Err(InventoryError::Validation(format!(
                "quantity for {} must be positive",
                item.product_id
            )));
        }
        let total: &mut u32 = merged.entry(item.product_id.clone()).or_default();
        *total = total.checked_add(item.quantity).ok_or_else(|| {
            InventoryError::Validation(format!("quantity for {} overflows", item.product_id))
        })?;
    }
    Ok(merged)
}

fn record_reserve(outcome: ReserveOutcome, start: Instant) -> ReserveOutcome {
    metrics::counter!("inventory_reservations_total", "outcome" => outcome.as_str()).increment(1);
    metrics::histogram!("inventory_reserve_duration_seconds").record(start.elapsed().as_secs_f64());
    outcome
}
