//! Choreographed order fulfillment saga.
//!
//! There is no coordinator: each service reacts to the events of the others.
//! This crate is the composition root. It builds the stores, declares the
//! queues, and runs one consumer per queue plus one outbox relay per
//! service against a shared [`transport::Transport`].
//!
//! ```text
//! order.created ──► inventory ──► inventory.reserved ──► order (Processing)
//!                        │                                  │
//!                        └─► inventory.insufficient ──► order (Cancelled) ─► order.cancelled ─► inventory (release)
//!
//! external trigger ──► payment ──► payment.processed ──► order (Confirmed)
//!                          └─────► payment.failed ────► order (Cancelled) ─► order.cancelled ─► inventory (release)
//! ```

pub mod backends;
pub mod config;
pub mod error;
pub mod runtime;

pub use backends::Backends;
pub use config::SagaConfig;
pub use error::{Result, SagaError};
pub use runtime::{SagaRuntime, SagaRuntimeBuilder};

/// Applies the SQL migrations in `migrations/`.
pub async fn run_migrations(pool: &sqlx::PgPool) -> Result<()> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}
