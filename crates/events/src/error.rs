use thiserror::Error;

/// Errors raised while encoding or decoding events.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The event type tag is not part of the registry.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// A required payload field is missing or has the wrong type.
    #[error("Malformed payload for {event_type}: {reason}")]
    MalformedPayload { event_type: String, reason: String },

    /// The envelope itself could not be parsed.
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Serialization of an outgoing envelope failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;
