use events::CodecError;
use thiserror::Error;

/// Errors that can occur when publishing, consuming or relaying events.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The broker connection has been closed.
    #[error("Transport closed")]
    Closed,

    /// A queue was referenced before being declared.
    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    /// A routing key or binding pattern is not a valid topic.
    #[error("Invalid topic pattern: {0}")]
    InvalidPattern(String),

    /// An envelope could not be encoded or an outbox row could not be decoded.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// A database error occurred in the outbox.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
