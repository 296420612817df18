use chrono::{DateTime, Utc};
use common::{OrderId, ProductId, ReservationId};
use events::StockItem;
use serde::{Deserialize, Serialize};

use crate::{InventoryError, Result};

/// A stocked product.
///
/// `reserved_quantity` never exceeds `stock_quantity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    pub stock_quantity: u32,
    pub reserved_quantity: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    pub fn new(id: ProductId, name: impl Into<String>, stock_quantity: u32, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: name.into(),
            stock_quantity,
            reserved_quantity: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn available_quantity(&self) -> u32 {
        self.stock_quantity.saturating_sub(self.reserved_quantity)
    }

    pub fn can_reserve(&self, quantity: u32) -> bool {
        self.available_quantity() >= quantity
    }

    pub(crate) fn reserve(&mut self, quantity: u32, now: DateTime<Utc>) -> Result<()> {
        if !self.can_reserve(quantity) {
            return Err(InventoryError::Corrupt(format!(
                "reserving {quantity} of {} with only {} available",
                self.id,
                self.available_quantity()
            )));
        }
        self.reserved_quantity += quantity;
        self.updated_at = now;
        Ok(())
    }

    pub(crate) fn release(&mut self, quantity: u32, now: DateTime<Utc>) -> Result<()> {
        self.reserved_quantity = self.reserved_quantity.checked_sub(quantity).ok_or_else(|| {
            InventoryError::Corrupt(format!(
                "releasing {quantity} of {} with only {} reserved",
                self.id, self.reserved_quantity
            ))
        })?;
        self.updated_at = now;
        Ok(())
    }

    pub(crate) fn add_stock(&mut self, quantity: u32, now: DateTime<Utc>) -> Result<()> {
        self.stock_quantity = self
            .stock_quantity
            .checked_add(quantity)
            .ok_or_else(|| InventoryError::Validation("stock quantity overflow".to_string()))?;
        self.updated_at = now;
        Ok(())
    }
}

/// Stock held for one (order, product) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub quantity: u32,
    pub is_released: bool,
    pub created_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

impl Reservation {
    pub fn new(order_id: OrderId, product_id: ProductId, quantity: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: ReservationId::new(),
            order_id,
            product_id,
            quantity,
            is_released: false,
            created_at: now,
            released_at: None,
        }
    }

    pub(crate) fn mark_released(&mut self, now: DateTime<Utc>) {
        self.is_released = true;
        self.released_at = Some(now);
    }
}

/// Result of a reservation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// Stock was reserved and `inventory.reserved` recorded.
    Reserved { items: Vec<StockItem> },
    /// The order already holds reservations; nothing changed.
    AlreadyReserved,
    /// At least one item could not be satisfied; `inventory.insufficient`
    /// recorded and nothing reserved.
    Insufficient { unavailable_items: Vec<StockItem> },
    /// The order was released before its reservation arrived; nothing reserved.
    OrderReleased,
}

impl ReserveOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReserveOutcome::Reserved { .. } => "reserved",
            ReserveOutcome::AlreadyReserved => "already_reserved",
            ReserveOutcome::Insufficient { .. } => "insufficient",
            ReserveOutcome::OrderReleased => "order_released",
        }
    }
}

/// Result of a release request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Outstanding reservations were released and `inventory.released` recorded.
    Released { items: Vec<StockItem> },
    /// Nothing was outstanding.
    NothingToRelease,
}
