use common::ProductId;
use thiserror::Error;

/// Errors that can occur in the inventory service.
#[derive(Debug, Error)]
pub enum InventoryError {
    /// The request is invalid and was rejected without side effects.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The product does not exist.
    #[error("Product not found: {0}")]
    ProductNotFound(ProductId),

    /// A product with this id already exists.
    #[error("Product already exists: {0}")]
    ProductAlreadyExists(ProductId),

    /// A lock could not be acquired in time or a concurrent writer won.
    /// Everything was rolled back; the operation may be retried.
    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// Stored data violates an invariant.
    #[error("Corrupt data: {0}")]
    Corrupt(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Writing to the outbox failed.
    #[error("Outbox error: {0}")]
    Outbox(#[from] transport::TransportError),
}

impl InventoryError {
    /// Returns true if retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            InventoryError::ConcurrencyConflict(_)
                | InventoryError::Database(_)
                | InventoryError::Outbox(_)
        )
    }
}

/// Result type for inventory operations.
pub type Result<T> = std::result::Result<T, InventoryError>;
