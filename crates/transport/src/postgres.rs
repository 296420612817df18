use async_trait::async_trait;
use chrono::{DateTime, Utc};
use events::EventEnvelope;
use sqlx::{PgConnection, PgPool, Row};

use crate::outbox::{Outbox, OutboxId, OutboxRecord};
use crate::Result;

/// PostgreSQL outbox backed by the shared `outbox` table.
///
/// Each service writes with its own `producer` name and relays only its
/// own rows.
#[derive(Clone)]
pub struct PostgresOutbox {
    pool: PgPool,
    producer: String,
}

impl PostgresOutbox {
    pub fn new(pool: PgPool, producer: impl Into<String>) -> Self {
        Self {
            pool,
            producer: producer.into(),
        }
    }

    pub fn producer(&self) -> &str {
        &self.producer
    }

    /// Inserts an event inside the caller's transaction so it commits or
    /// rolls back with the state change.
    pub async fn enqueue(
        conn: &mut PgConnection,
        producer: &str,
        envelope: &EventEnvelope,
    ) -> Result<OutboxId> {
        let body = events::encode(envelope)?;
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO outbox (producer, event_id, event_type, correlation_id, body, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(producer)
        .bind(envelope.event_id.as_uuid())
        .bind(envelope.event_type().as_str())
        .bind(envelope.correlation_id.as_str())
        .bind(body)
        .bind(envelope.timestamp)
        .fetch_one(&mut *conn)
        .await?;
        Ok(id)
    }
}

#[async_trait]
impl Outbox for PostgresOutbox {
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, body, created_at
            FROM outbox
            WHERE producer = $1 AND delivered_at IS NULL
            ORDER BY id
            LIMIT $2
            "#,
        )
        .bind(&self.producer)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<OutboxRecord> {
                let body: Vec<u8> = row.try_get("body")?;
                let created_at: DateTime<Utc> = row.try_get("created_at")?;
                Ok(OutboxRecord {
                    id: row.try_get("id")?,
                    envelope: events::decode_envelope(&body)?,
                    created_at,
                })
            })
            .collect()
    }

    async fn mark_delivered(&self, ids: &[OutboxId]) -> Result<()> {
        sqlx::query(
            "UPDATE outbox SET delivered_at = NOW() WHERE id = ANY($1) AND delivered_at IS NULL",
        )
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
