//! Saga runtime error types.

use thiserror::Error;

/// Errors raised while starting, driving or stopping the saga runtime.
#[derive(Debug, Error)]
pub enum SagaError {
    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Order error: {0}")]
    Order(#[from] order::OrderError),

    #[error("Inventory error: {0}")]
    Inventory(#[from] inventory::InventoryError),

    #[error("Payment error: {0}")]
    Payment(#[from] payment::PaymentError),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A background task panicked or was aborted.
    #[error("Task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
