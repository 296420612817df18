use async_trait::async_trait;
use common::{Money, OrderId, PaymentId, UserId, Version};
use events::EventEnvelope;
use sqlx::{PgPool, Row, postgres::PgRow};
use transport::PostgresOutbox;
use uuid::Uuid;

use crate::model::Payment;
use crate::store::PaymentStore;
use crate::{PRODUCER, PaymentError, Result};

const PAYMENT_COLUMNS: &str = "id, order_id, user_id, amount_cents, payment_method, status, \
     transaction_id, failure_reason, created_at, updated_at, processed_at, failed_at, version";

/// PostgreSQL-backed payment store.
///
/// `unique_payment_order` keeps one row per order; terminal updates are
/// guarded by the `version` column.
#[derive(Clone)]
pub struct PostgresPaymentStore {
    pool: PgPool,
}

impl PostgresPaymentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn select_one(&self, column: &str, id: Uuid) -> Result<Option<Payment>> {
        let row = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE {column} = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_payment).transpose()
    }
}

fn row_to_payment(row: &PgRow) -> Result<Payment> {
    let status: String = row.try_get("status")?;
    Ok(Payment {
        id: PaymentId::from_uuid(row.try_get::<Uuid, _>("id")?),
        order_id: OrderId::from_uuid(row.try_get::<Uuid, _>("order_id")?),
        user_id: UserId::new(row.try_get::<String, _>("user_id")?),
        amount: Money::from_cents(row.try_get("amount_cents")?),
        payment_method: row.try_get("payment_method")?,
        status: status.parse()?,
        transaction_id: row.try_get("transaction_id")?,
        failure_reason: row.try_get("failure_reason")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        processed_at: row.try_get("processed_at")?,
        failed_at: row.try_get("failed_at")?,
        version: Version::new(row.try_get("version")?),
    })
}

#[async_trait]
impl PaymentStore for PostgresPaymentStore {
    async fn get(&self, id: PaymentId) -> Result<Option<Payment>> {
        self.select_one("id", id.as_uuid()).await
    }

    async fn find_by_order(&self, order_id: OrderId) -> Result<Option<Payment>> {
        self.select_one("order_id", order_id.as_uuid()).await
    }

    async fn insert_if_absent(&self, payment: &Payment) -> Result<Payment> {
        sqlx::query(
            r#"
            INSERT INTO payments
                (id, order_id, user_id, amount_cents, status, transaction_id, failure_reason,
                 created_at, updated_at, processed_at, failed_at, version, payment_method)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (order_id) DO NOTHING
            "#,
        )
        .bind(payment.id.as_uuid())
        .bind(payment.order_id.as_uuid())
        .bind(payment.user_id.as_str())
        .bind(payment.amount.cents())
        .bind(payment.status.as_str())
        .bind(&payment.transaction_id)
        .bind(&payment.failure_reason)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .bind(payment.processed_at)
        .bind(payment.failed_at)
        .bind(payment.version.as_i64())
        .bind(&payment.payment_method)
        .execute(&self.pool)
        .await?;

        self.find_by_order(payment.order_id).await?.ok_or_else(|| {
            PaymentError::Corrupt(format!("payment for order {} vanished", payment.order_id))
        })
    }

    async fn save(&self, payment: &Payment, expected: Version, event: EventEnvelope) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE payments
            SET status = $3, transaction_id = $4, failure_reason = $5, updated_at = $6,
                processed_at = $7, failed_at = $8, version = $9
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(payment.id.as_uuid())
        .bind(expected.as_i64())
        .bind(payment.status.as_str())
        .bind(&payment.transaction_id)
        .bind(&payment.failure_reason)
        .bind(payment.updated_at)
        .bind(payment.processed_at)
        .bind(payment.failed_at)
        .bind(payment.version.as_i64())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(PaymentError::ConcurrencyConflict(format!(
                "payment {} is no longer at version {}",
                payment.id, expected
            )));
        }

        PostgresOutbox::enqueue(&mut *tx, PRODUCER, &event).await?;
        tx.commit().await?;
        Ok(())
    }
}
