use std::time::Duration;

use async_trait::async_trait;
use common::{OrderId, ProductId, ReservationId};
use events::EventEnvelope;
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use transport::PostgresOutbox;
use uuid::Uuid;

use crate::model::{Product, Reservation};
use crate::store::{InventoryStore, InventoryTx};
use crate::{InventoryError, PRODUCER, Result};

const PRODUCT_COLUMNS: &str =
    "id, name, stock_quantity, reserved_quantity, created_at, updated_at";
const RESERVATION_COLUMNS: &str =
    "id, order_id, product_id, quantity, is_released, created_at, released_at";

/// PostgreSQL-backed inventory store.
///
/// Product locks are `SELECT ... FOR UPDATE` row locks; order locks are
/// transaction-scoped advisory locks. Both waits are bounded by
/// `lock_timeout`.
#[derive(Clone)]
pub struct PostgresInventoryStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PostgresInventoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn to_u32(value: i32, column: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| InventoryError::Corrupt(format!("negative {column}: {value}")))
}

fn to_i32(value: u32) -> Result<i32> {
    i32::try_from(value).map_err(|_| InventoryError::Validation(format!("quantity too large: {value}")))
}

fn row_to_product(row: &PgRow) -> Result<Product> {
    Ok(Product {
        id: ProductId::new(row.try_get::<String, _>("id")?),
        name: row.try_get("name")?,
        stock_quantity: to_u32(row.try_get("stock_quantity")?, "stock_quantity")?,
        reserved_quantity: to_u32(row.try_get("reserved_quantity")?, "reserved_quantity")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_reservation(row: &PgRow) -> Result<Reservation> {
    Ok(Reservation {
        id: ReservationId::from_uuid(row.try_get::<Uuid, _>("id")?),
        order_id: OrderId::from_uuid(row.try_get::<Uuid, _>("order_id")?),
        product_id: ProductId::new(row.try_get::<String, _>("product_id")?),
        quantity: to_u32(row.try_get("quantity")?, "quantity")?,
        is_released: row.try_get("is_released")?,
        created_at: row.try_get("created_at")?,
        released_at: row.try_get("released_at")?,
    })
}

/// Maps lock timeouts, deadlocks and serialization failures to conflicts.
fn map_lock_error(e: sqlx::Error, what: &str) -> InventoryError {
    if let sqlx::Error::Database(ref db_err) = e
        && matches!(db_err.code().as_deref(), Some("55P03" | "40P01" | "40001"))
    {
        return InventoryError::ConcurrencyConflict(format!("lock on {what}: {}", db_err.message()));
    }
    InventoryError::Database(e)
}

#[async_trait]
impl InventoryStore for PostgresInventoryStore {
    async fn begin(&self) -> Result<Box<dyn InventoryTx>> {
        let mut tx = self.pool.begin().await?;
        // SET does not take bind parameters; the value is an integer.
        sqlx::query(&format!(
            "SET LOCAL lock_timeout = '{}ms'",
            self.lock_timeout.as_millis()
        ))
        .execute(&mut *tx)
        .await?;
        Ok(Box::new(PostgresInventoryTx { tx }))
    }

    async fn get_product(&self, id: &ProductId) -> Result<Option<Product>> {
        let row = sqlx::query(&format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id = $1"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_product).transpose()
    }

    async fn list_products(&self) -> Result<Vec<Product>> {
        let rows = sqlx::query(&format!("SELECT {PRODUCT_COLUMNS} FROM products ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_product).collect()
    }

    async fn reservations_for_order(&self, order_id: OrderId) -> Result<Vec<Reservation>> {
        let rows = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM inventory_reservations WHERE order_id = $1 ORDER BY product_id"
        ))
        .bind(order_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_reservation).collect()
    }
}

struct PostgresInventoryTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl InventoryTx for PostgresInventoryTx {
    async fn lock_order(&mut self, order_id: OrderId) -> Result<()> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(order_id.to_string())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_lock_error(e, &format!("order {order_id}")))?;
        Ok(())
    }

    async fn lock_product(&mut self, id: &ProductId) -> Result<Option<Product>> {
        let row = sqlx::query(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_str())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_lock_error(e, &format!("product {id}")))?;
        row.as_ref().map(row_to_product).transpose()
    }

    async fn reservations_for_order(&mut self, order_id: OrderId) -> Result<Vec<Reservation>> {
        let rows = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM inventory_reservations WHERE order_id = $1 ORDER BY product_id"
        ))
        .bind(order_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter().map(row_to_reservation).collect()
    }

    async fn is_order_released(&mut self, order_id: OrderId) -> Result<bool> {
        let released: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM inventory_released_orders WHERE order_id = $1)",
        )
        .bind(order_id.as_uuid())
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(released)
    }

    async fn mark_order_released(&mut self, order_id: OrderId) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO inventory_released_orders (order_id, released_at)
            VALUES ($1, NOW())
            ON CONFLICT (order_id) DO NOTHING
            "#,
        )
        .bind(order_id.as_uuid())
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_product(&mut self, product: &Product) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO products (id, name, stock_quantity, reserved_quantity, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(product.id.as_str())
        .bind(&product.name)
        .bind(to_i32(product.stock_quantity)?)
        .bind(to_i32(product.reserved_quantity)?)
        .bind(product.created_at)
        .bind(product.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.is_unique_violation()
            {
                return InventoryError::ProductAlreadyExists(product.id.clone());
            }
            InventoryError::Database(e)
        })?;
        Ok(())
    }

    async fn update_product(&mut self, product: &Product) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE products
            SET name = $2, stock_quantity = $3, reserved_quantity = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(product.id.as_str())
        .bind(&product.name)
        .bind(to_i32(product.stock_quantity)?)
        .bind(to_i32(product.reserved_quantity)?)
        .bind(product.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_reservation(&mut self, reservation: &Reservation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO inventory_reservations
                (id, order_id, product_id, quantity, is_released, created_at, released_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(reservation.id.as_uuid())
        .bind(reservation.order_id.as_uuid())
        .bind(reservation.product_id.as_str())
        .bind(to_i32(reservation.quantity)?)
        .bind(reservation.is_released)
        .bind(reservation.created_at)
        .bind(reservation.released_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.constraint() == Some("unique_order_product")
            {
                return InventoryError::ConcurrencyConflict(format!(
                    "order {} already reserved {}",
                    reservation.order_id, reservation.product_id
                ));
            }
            InventoryError::Database(e)
        })?;
        Ok(())
    }

    async fn update_reservation(&mut self, reservation: &Reservation) -> Result<()> {
        sqlx::query(
            "UPDATE inventory_reservations SET is_released = $2, released_at = $3 WHERE id = $1",
        )
        .bind(reservation.id.as_uuid())
        .bind(reservation.is_released)
        .bind(reservation.released_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn enqueue(&mut self, envelope: EventEnvelope) -> Result<()> {
        PostgresOutbox::enqueue(&mut *self.tx, PRODUCER, &envelope).await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
