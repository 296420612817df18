use async_trait::async_trait;
use common::{Money, OrderId, UserId, Version};
use events::{EventEnvelope, OrderLine};
use sqlx::{PgPool, Postgres, QueryBuilder, Row, postgres::PgRow};
use transport::PostgresOutbox;
use uuid::Uuid;

use crate::aggregate::Order;
use crate::store::{OrderQuery, OrderStore};
use crate::{OrderError, PRODUCER, Result};

const ORDER_COLUMNS: &str = "id, user_id, status, items, total_amount_cents, created_at, \
     updated_at, confirmed_at, cancelled_at, cancellation_reason, version";

/// PostgreSQL-backed order store. Items are kept as a JSONB array.
#[derive(Clone)]
pub struct PostgresOrderStore {
    pool: PgPool,
}

impl PostgresOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn row_to_order(row: &PgRow) -> Result<Order> {
    let status: String = row.try_get("status")?;
    let items: serde_json::Value = row.try_get("items")?;
    let items: Vec<OrderLine> = serde_json::from_value(items)?;
    Ok(Order {
        id: OrderId::from_uuid(row.try_get::<Uuid, _>("id")?),
        user_id: UserId::new(row.try_get::<String, _>("user_id")?),
        status: status
            .parse()
            .map_err(|_| OrderError::Corrupt(format!("unknown order status: {status}")))?,
        items,
        total_amount: Money::from_cents(row.try_get("total_amount_cents")?),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        confirmed_at: row.try_get("confirmed_at")?,
        cancelled_at: row.try_get("cancelled_at")?,
        cancellation_reason: row.try_get("cancellation_reason")?,
        version: Version::new(row.try_get("version")?),
    })
}

#[async_trait]
impl OrderStore for PostgresOrderStore {
    async fn insert(&self, order: &Order, event: EventEnvelope) -> Result<()> {
        let items = serde_json::to_value(&order.items)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO orders
                (id, user_id, status, items, total_amount_cents, created_at, updated_at,
                 confirmed_at, cancelled_at, cancellation_reason, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(order.id.as_uuid())
        .bind(order.user_id.as_str())
        .bind(order.status.as_str())
        .bind(items)
        .bind(order.total_amount.cents())
        .bind(order.created_at)
        .bind(order.updated_at)
        .bind(order.confirmed_at)
        .bind(order.cancelled_at)
        .bind(&order.cancellation_reason)
        .bind(order.version.as_i64())
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.is_unique_violation()
            {
                return OrderError::ConcurrencyConflict(format!("order {} already exists", order.id));
            }
            OrderError::Database(e)
        })?;

        PostgresOutbox::enqueue(&mut *tx, PRODUCER, &event).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: OrderId) -> Result<Option<Order>> {
        let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_order).transpose()
    }

    async fn list(&self, query: &OrderQuery) -> Result<Vec<Order>> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {ORDER_COLUMNS} FROM orders WHERE TRUE"));
        if let Some(user_id) = &query.user_id {
            builder.push(" AND user_id = ").push_bind(user_id.as_str().to_string());
        }
        if let Some(status) = query.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        builder
            .push(" ORDER BY created_at DESC, id LIMIT ")
            .push_bind(i64::try_from(query.limit).unwrap_or(i64::MAX))
            .push(" OFFSET ")
            .push_bind(i64::try_from(query.offset).unwrap_or(i64::MAX));

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_order).collect()
    }

    async fn save(&self, order: &Order, expected: Version, event: Option<EventEnvelope>) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE orders
            SET status = $3, updated_at = $4, confirmed_at = $5, cancelled_at = $6,
                cancellation_reason = $7, version = $8
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(order.id.as_uuid())
        .bind(expected.as_i64())
        .bind(order.status.as_str())
        .bind(order.updated_at)
        .bind(order.confirmed_at)
        .bind(order.cancelled_at)
        .bind(&order.cancellation_reason)
        .bind(order.version.as_i64())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(OrderError::ConcurrencyConflict(format!(
                "order {} is no longer at version {}",
                order.id, expected
            )));
        }

        if let Some(event) = event {
            PostgresOutbox::enqueue(&mut *tx, PRODUCER, &event).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
