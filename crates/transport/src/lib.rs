//! Event transport for the fulfillment services.
//!
//! This crate provides:
//! - A [`Transport`] abstraction over a single topic exchange with
//!   prefetch-bounded, acknowledged [`Subscription`]s
//! - [`InMemoryBroker`], an in-process broker with dead-letter queues and
//!   simulated connection loss
//! - [`PostgresBroker`], a durable broker whose queues are PostgreSQL rows
//! - [`Consumer`], which decodes deliveries and drives a [`MessageHandler`]
//! - A transactional outbox ([`Outbox`]) and the [`OutboxRelay`] that
//!   publishes committed rows

pub mod broker;
pub mod consumer;
pub mod error;
pub mod message;
pub mod outbox;
pub mod postgres;
pub mod postgres_broker;
pub mod topic;

pub use broker::{DEFAULT_EXCHANGE, InMemoryBroker, QueueSpec, Subscription, Transport};
pub use consumer::{Consumer, HandlerError, MessageHandler};
pub use error::{Result, TransportError};
pub use message::{DELIVERY_COUNT_HEADER, DEATH_REASON_HEADER, Delivery, DeliveryTag, Message};
pub use outbox::{InMemoryOutbox, Outbox, OutboxId, OutboxRecord, OutboxRelay};
pub use postgres::PostgresOutbox;
pub use postgres_broker::PostgresBroker;
pub use topic::topic_matches;

/// Suffix of the dead-letter queue that accompanies every declared queue.
pub const DEAD_LETTER_SUFFIX: &str = ".dead-letter";

/// Returns the dead-letter queue name for a queue.
pub fn dead_letter_queue(queue: &str) -> String {
    format!("{queue}{DEAD_LETTER_SUFFIX}")
}
