//! Transactional outbox.
//!
//! Services write their outgoing events into an outbox in the same atomic
//! step as their state change. An [`OutboxRelay`] later publishes the pending
//! rows in insertion order and marks them delivered. A crash between publish
//! and mark republishes the row, so consumers must be idempotent.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use events::EventEnvelope;
use tokio::sync::watch;

use crate::broker::Transport;
use crate::Result;

/// Position of a row in an outbox. Increases with insertion order.
pub type OutboxId = i64;

/// An event waiting to be published.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    pub id: OutboxId,
    pub envelope: EventEnvelope,
    pub created_at: DateTime<Utc>,
}

/// Read side of an outbox, used by the relay.
#[async_trait]
pub trait Outbox: Send + Sync {
    /// Returns up to `limit` undelivered rows, oldest first.
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxRecord>>;

    /// Marks rows as delivered. Unknown ids are ignored.
    async fn mark_delivered(&self, ids: &[OutboxId]) -> Result<()>;
}

#[derive(Debug)]
struct Row {
    record: OutboxRecord,
    delivered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct OutboxState {
    next_id: OutboxId,
    rows: BTreeMap<OutboxId, Row>,
}

/// In-memory outbox.
///
/// Writes are synchronous so an in-memory store can append to the outbox
/// while holding its own state lock, which makes the pair atomic.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOutbox {
    state: Arc<Mutex<OutboxState>>,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, OutboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends events in order.
    pub fn push_all(&self, envelopes: impl IntoIterator<Item = EventEnvelope>) {
        let mut state = self.lock();
        for envelope in envelopes {
            state.next_id += 1;
            let id = state.next_id;
            let created_at = envelope.timestamp;
            state.rows.insert(
                id,
                Row {
                    record: OutboxRecord {
                        id,
                        envelope,
                        created_at,
                    },
                    delivered_at: None,
                },
            );
        }
    }

    pub fn push(&self, envelope: EventEnvelope) {
        self.push_all(std::iter::once(envelope));
    }

    /// Every envelope ever written, delivered or not, oldest first.
    pub fn all(&self) -> Vec<EventEnvelope> {
        self.lock()
            .rows
            .values()
            .map(|row| row.record.envelope.clone())
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.lock()
            .rows
            .values()
            .filter(|row| row.delivered_at.is_none())
            .count()
    }
}

#[async_trait]
impl Outbox for InMemoryOutbox {
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        Ok(self
            .lock()
            .rows
            .values()
            .filter(|row| row.delivered_at.is_none())
            .take(limit)
            .map(|row| row.record.clone())
            .collect())
    }

    async fn mark_delivered(&self, ids: &[OutboxId]) -> Result<()> {
        let now = Utc::now();
        let mut state = self.lock();
        for id in ids {
            if let Some(row) = state.rows.get_mut(id) {
                row.delivered_at.get_or_insert(now);
            }
        }
        Ok(())
    }
}

/// Publishes committed outbox rows to a transport.
pub struct OutboxRelay {
    name: String,
    outbox: Arc<dyn Outbox>,
    transport: Arc<dyn Transport>,
    batch_size: usize,
    poll_interval: Duration,
}

impl OutboxRelay {
    pub const DEFAULT_BATCH_SIZE: usize = 100;
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

    pub fn new(
        name: impl Into<String>,
        outbox: Arc<dyn Outbox>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            name: name.into(),
            outbox,
            transport,
            batch_size: Self::DEFAULT_BATCH_SIZE,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Publishes one batch of pending rows. Returns how many were published.
    ///
    /// On a publish failure the rows already published are still marked
    /// delivered before the error is returned.
    #[tracing::instrument(skip(self), fields(relay = %self.name))]
    pub async fn run_once(&self) -> Result<usize> {
        let pending = self.outbox.pending(self.batch_size).await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let mut published = Vec::with_capacity(pending.len());
        let mut failure = None;
        for record in &pending {
            match self.transport.publish(&record.envelope).await {
                Ok(()) => {
                    tracing::debug!(
                        outbox_id = record.id,
                        event_type = %record.envelope.event_type(),
                        event_id = %record.envelope.event_id,
                        "Relayed event"
                    );
                    published.push(record.id);
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if !published.is_empty() {
            self.outbox.mark_delivered(&published).await?;
            metrics::counter!("outbox_relayed_total", "relay" => self.name.clone())
                .increment(published.len() as u64);
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(published.len()),
        }
    }

    /// Polls until the shutdown flag is set, draining full batches without
    /// waiting. Errors are logged and retried on the next poll.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(relay = %self.name, "Outbox relay started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let drained = match self.run_once().await {
                Ok(n) => n < self.batch_size,
                Err(e) => {
                    tracing::error!(relay = %self.name, error = %e, "Outbox relay failed");
                    true
                }
            };
            if !drained {
                continue;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        // Flush what was committed before shutdown.
        if let Err(e) = self.run_once().await {
            tracing::warn!(relay = %self.name, error = %e, "Final outbox flush failed");
        }
        tracing::info!(relay = %self.name, "Outbox relay stopped");
    }
}
