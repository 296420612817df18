use chrono::{DateTime, Utc};
use common::CorrelationId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::payload::Event;
use crate::registry::EventType;

/// Unique identifier for a published event. Also the transport message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an event ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// An immutable event together with its routing metadata.
///
/// The event type is not stored separately; it is always derived from the
/// payload variant so the two can never disagree.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    /// Unique per publish.
    pub event_id: EventId,

    /// When the event was produced.
    pub timestamp: DateTime<Utc>,

    /// Saga correlation key, the order id for every saga event.
    pub correlation_id: CorrelationId,

    pub payload: Event,
}

impl EventEnvelope {
    /// Wraps a payload with a fresh id, the current time, and the payload's
    /// order id as correlation id.
    pub fn new(payload: Event) -> Self {
        Self {
            event_id: EventId::new(),
            timestamp: Utc::now(),
            correlation_id: CorrelationId::from(payload.order_id()),
            payload,
        }
    }

    /// Overrides the correlation id.
    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Overrides the timestamp.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Overrides the event id.
    pub fn with_event_id(mut self, event_id: EventId) -> Self {
        self.event_id = event_id;
        self
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    /// Routing key used on the exchange.
    pub fn routing_key(&self) -> &'static str {
        self.event_type().as_str()
    }
}
