use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::CorrelationId;
use events::EventId;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::broker::{QueueSpec, Subscription, Transport};
use crate::message::{
    CONTENT_TYPE_JSON, DEATH_REASON_HEADER, DELIVERY_COUNT_HEADER, Delivery, DeliveryTag, Message,
};
use crate::topic::{is_valid_pattern, topic_matches};
use crate::{DEAD_LETTER_SUFFIX, Result, TransportError, dead_letter_queue};

/// Topic exchange whose queues live in PostgreSQL.
///
/// Published messages are committed to `broker_messages` before `publish`
/// returns, so they survive a restart of every process. Subscribers lease
/// rows with `FOR UPDATE SKIP LOCKED`; a lease that is neither acked nor
/// nacked expires and the row is delivered again.
///
/// Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct PostgresBroker {
    pool: PgPool,
    exchange: String,
    lease: Duration,
    poll_interval: Duration,
    closed: Arc<AtomicBool>,
}

impl PostgresBroker {
    pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);

    pub fn new(pool: PgPool, exchange: impl Into<String>) -> Self {
        Self {
            pool,
            exchange: exchange.into(),
            lease: Self::DEFAULT_LEASE,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// How long a delivery may stay unsettled before it is redelivered.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Delay between polls of an empty queue.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Number of messages on a queue that are not currently leased.
    pub async fn queue_depth(&self, queue: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM broker_messages
            WHERE queue = $1 AND (leased_until IS NULL OR leased_until < NOW())
            "#,
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }

    /// Messages in a queue's dead-letter queue, oldest first.
    pub async fn dead_letters(&self, queue: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT message_id, correlation_id, routing_key, headers, body
            FROM broker_messages
            WHERE queue = $1
            ORDER BY id
            "#,
        )
        .bind(dead_letter_queue(queue))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for PostgresBroker {
    fn exchange(&self) -> &str {
        &self.exchange
    }

    async fn publish_message(&self, message: Message) -> Result<()> {
        self.ensure_open()?;

        let mut tx = self.pool.begin().await?;
        let bindings: Vec<(String, String)> =
            sqlx::query_as("SELECT queue, pattern FROM broker_bindings WHERE exchange = $1")
                .bind(&self.exchange)
                .fetch_all(&mut *tx)
                .await?;

        let mut queues: Vec<&str> = bindings
            .iter()
            .filter(|(_, pattern)| topic_matches(pattern, &message.routing_key))
            .map(|(queue, _)| queue.as_str())
            .collect();
        queues.sort_unstable();
        queues.dedup();

        let mut headers = message.headers.clone();
        headers.remove(DELIVERY_COUNT_HEADER);
        for queue in &queues {
            sqlx::query(
                r#"
                INSERT INTO broker_messages (queue, message_id, correlation_id, routing_key, headers, body)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(queue)
            .bind(message.message_id.as_uuid())
            .bind(message.correlation_id.as_str())
            .bind(&message.routing_key)
            .bind(Json(&headers))
            .bind(&message.body)
            .execute(&mut *tx)
            .await?;
            tracing::trace!(queue = %queue, routing_key = %message.routing_key, "Routed");
        }
        tx.commit().await?;

        if queues.is_empty() {
            tracing::debug!(
                exchange = %self.exchange,
                routing_key = %message.routing_key,
                message_id = %message.message_id,
                "Unroutable message dropped"
            );
        }
        metrics::counter!("transport_published_total", "routing_key" => message.routing_key.clone())
            .increment(1);
        Ok(())
    }

    async fn declare_queue(&self, spec: QueueSpec) -> Result<Box<dyn Subscription>> {
        if spec.name.is_empty() {
            return Err(TransportError::UnknownQueue(spec.name));
        }
        if let Some(bad) = spec.routing_keys.iter().find(|p| !is_valid_pattern(p)) {
            return Err(TransportError::InvalidPattern(bad.clone()));
        }
        self.ensure_open()?;

        let max_deliveries = spec.max_deliveries.max(1);
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO broker_queues (name, max_deliveries) VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET max_deliveries = EXCLUDED.max_deliveries
            "#,
        )
        .bind(&spec.name)
        .bind(max_deliveries as i32)
        .execute(&mut *tx)
        .await?;

        if !spec.name.ends_with(DEAD_LETTER_SUFFIX) {
            sqlx::query(
                "INSERT INTO broker_queues (name, max_deliveries) VALUES ($1, $2) ON CONFLICT (name) DO NOTHING",
            )
            .bind(dead_letter_queue(&spec.name))
            .bind(max_deliveries as i32)
            .execute(&mut *tx)
            .await?;
        }

        for key in &spec.routing_keys {
            sqlx::query(
                r#"
                INSERT INTO broker_bindings (exchange, queue, pattern) VALUES ($1, $2, $3)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(&self.exchange)
            .bind(&spec.name)
            .bind(key)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        tracing::info!(
            exchange = %self.exchange,
            queue = %spec.name,
            bindings = ?spec.routing_keys,
            prefetch = spec.prefetch,
            "Queue declared"
        );

        Ok(Box::new(PostgresSubscription {
            pool: self.pool.clone(),
            closed: Arc::clone(&self.closed),
            queue: spec.name,
            prefetch: spec.prefetch.max(1),
            max_deliveries,
            lease: self.lease,
            poll_interval: self.poll_interval,
            next_tag: 0,
            outstanding: HashMap::new(),
        }))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// A row leased by one delivery.
struct Lease {
    id: i64,
    token: Uuid,
    delivery_count: u32,
}

struct PostgresSubscription {
    pool: PgPool,
    closed: Arc<AtomicBool>,
    queue: String,
    prefetch: usize,
    max_deliveries: u32,
    lease: Duration,
    poll_interval: Duration,
    next_tag: u64,
    outstanding: HashMap<DeliveryTag, Lease>,
}

impl PostgresSubscription {
    /// Leases the oldest deliverable row of the queue.
    async fn lease_next(&mut self) -> Result<Option<Delivery>> {
        let token = Uuid::new_v4();
        let row = sqlx::query(
            r#"
            UPDATE broker_messages
            SET delivery_count = delivery_count + 1,
                lease_token = $2,
                leased_until = NOW() + make_interval(secs => $3)
            WHERE id = (
                SELECT id FROM broker_messages
                WHERE queue = $1 AND (leased_until IS NULL OR leased_until < NOW())
                ORDER BY id
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, message_id, correlation_id, routing_key, headers, body, delivery_count
            "#,
        )
        .bind(&self.queue)
        .bind(token)
        .bind(self.lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let id: i64 = row.try_get("id")?;
        let count: i32 = row.try_get("delivery_count")?;
        let delivery_count = count.max(0) as u32;
        let lease = Lease {
            id,
            token,
            delivery_count,
        };

        // Leases that expired without being settled still count as deliveries.
        if delivery_count > self.max_deliveries {
            self.dead_letter(&lease, "delivery limit reached").await?;
            return Ok(None);
        }

        let mut message = message_from_row(&row)?;
        message
            .headers
            .insert(DELIVERY_COUNT_HEADER.to_string(), delivery_count.to_string());

        self.next_tag += 1;
        let tag = DeliveryTag(self.next_tag);
        self.outstanding.insert(tag, lease);

        Ok(Some(Delivery {
            tag,
            queue: self.queue.clone(),
            redelivered: delivery_count > 1,
            message,
        }))
    }

    async fn dead_letter(&self, lease: &Lease, reason: &str) -> Result<()> {
        let moved = sqlx::query(
            r#"
            UPDATE broker_messages
            SET queue = $3,
                delivery_count = 0,
                lease_token = NULL,
                leased_until = NULL,
                headers = headers || jsonb_build_object($4::text, $5::text)
            WHERE id = $1 AND lease_token = $2
            "#,
        )
        .bind(lease.id)
        .bind(lease.token)
        .bind(dead_letter_queue(&self.queue))
        .bind(DEATH_REASON_HEADER)
        .bind(reason)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if moved == 1 {
            tracing::warn!(queue = %self.queue, row = lease.id, reason, "Message dead-lettered");
            metrics::counter!("transport_dead_lettered_total", "queue" => self.queue.clone())
                .increment(1);
        }
        Ok(())
    }
}

#[async_trait]
impl Subscription for PostgresSubscription {
    fn queue(&self) -> &str {
        &self.queue
    }

    async fn recv(&mut self) -> Option<Delivery> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            if self.outstanding.len() < self.prefetch {
                match self.lease_next().await {
                    Ok(Some(delivery)) => return Some(delivery),
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(queue = %self.queue, error = %e, "Failed to lease message")
                    }
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn ack(&mut self, tag: DeliveryTag) -> Result<()> {
        let Some(lease) = self.outstanding.remove(&tag) else {
            tracing::debug!(queue = %self.queue, %tag, "Ignoring ack for unknown delivery");
            return Ok(());
        };
        let deleted = sqlx::query("DELETE FROM broker_messages WHERE id = $1 AND lease_token = $2")
            .bind(lease.id)
            .bind(lease.token)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if deleted == 0 {
            tracing::debug!(queue = %self.queue, %tag, "Lease expired before ack");
        }
        Ok(())
    }

    async fn nack(&mut self, tag: DeliveryTag, requeue: bool) -> Result<()> {
        let Some(lease) = self.outstanding.remove(&tag) else {
            tracing::debug!(queue = %self.queue, %tag, "Ignoring nack for unknown delivery");
            return Ok(());
        };

        if !requeue {
            return self.dead_letter(&lease, "rejected").await;
        }
        if lease.delivery_count >= self.max_deliveries {
            return self.dead_letter(&lease, "delivery limit reached").await;
        }

        sqlx::query(
            r#"
            UPDATE broker_messages SET lease_token = NULL, leased_until = NULL
            WHERE id = $1 AND lease_token = $2
            "#,
        )
        .bind(lease.id)
        .bind(lease.token)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

impl Drop for PostgresSubscription {
    fn drop(&mut self) {
        if self.outstanding.is_empty() {
            return;
        }
        let tokens: Vec<Uuid> = self.outstanding.drain().map(|(_, l)| l.token).collect();
        // Without a runtime the leases simply expire.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let pool = self.pool.clone();
        let queue = self.queue.clone();
        handle.spawn(async move {
            let released = sqlx::query(
                r#"
                UPDATE broker_messages SET lease_token = NULL, leased_until = NULL
                WHERE lease_token = ANY($1)
                "#,
            )
            .bind(&tokens)
            .execute(&pool)
            .await;
            match released {
                Ok(done) => tracing::debug!(
                    queue = %queue,
                    returned = done.rows_affected(),
                    "Subscription dropped with unacked deliveries"
                ),
                Err(e) => tracing::warn!(queue = %queue, error = %e, "Failed to release leases"),
            }
        });
    }
}

fn message_from_row(row: &PgRow) -> Result<Message> {
    let message_id: Uuid = row.try_get("message_id")?;
    let correlation_id: String = row.try_get("correlation_id")?;
    let Json(headers): Json<BTreeMap<String, String>> = row.try_get("headers")?;
    Ok(Message {
        message_id: EventId::from_uuid(message_id),
        correlation_id: CorrelationId::new(correlation_id),
        routing_key: row.try_get("routing_key")?,
        content_type: CONTENT_TYPE_JSON,
        headers,
        body: row.try_get("body")?,
    })
}
