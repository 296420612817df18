use common::PaymentId;
use thiserror::Error;

/// Errors that can occur in the payment service.
#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Payment not found: {0}")]
    NotFound(PaymentId),

    /// Another attempt settled the payment first. Nothing was written.
    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("Corrupt data: {0}")]
    Corrupt(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Outbox error: {0}")]
    Outbox(#[from] transport::TransportError),
}

impl PaymentError {
    /// Returns true if retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PaymentError::ConcurrencyConflict(_) | PaymentError::Database(_) | PaymentError::Outbox(_)
        )
    }
}

/// Result type for payment operations.
pub type Result<T> = std::result::Result<T, PaymentError>;
