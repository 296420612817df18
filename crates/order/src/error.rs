use common::OrderId;
use thiserror::Error;

use crate::state::OrderStatus;

/// Errors that can occur in the order service.
#[derive(Debug, Error)]
pub enum OrderError {
    /// The request is invalid and was rejected without side effects.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Order not found: {0}")]
    NotFound(OrderId),

    /// Order is not in a state that allows the action.
    #[error("Invalid state transition: cannot {action} from {current} state")]
    InvalidStateTransition {
        current: OrderStatus,
        action: &'static str,
    },

    /// The order changed since it was read. Nothing was written.
    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("Corrupt data: {0}")]
    Corrupt(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Outbox error: {0}")]
    Outbox(#[from] transport::TransportError),
}

impl OrderError {
    /// Returns true if retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OrderError::ConcurrencyConflict(_) | OrderError::Database(_) | OrderError::Outbox(_)
        )
    }
}

/// Result type for order operations.
pub type Result<T> = std::result::Result<T, OrderError>;
