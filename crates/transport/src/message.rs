use std::collections::BTreeMap;

use common::CorrelationId;
use events::{EventEnvelope, EventId};

use crate::Result;

/// Header carrying how many times a message has been delivered, this
/// delivery included.
pub const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// Header set on dead-lettered messages.
pub const DEATH_REASON_HEADER: &str = "x-death-reason";

/// Content type of every envelope body.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// A message as stored on a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// The event id of the carried envelope.
    pub message_id: EventId,
    pub correlation_id: CorrelationId,
    pub routing_key: String,
    pub content_type: &'static str,
    pub headers: BTreeMap<String, String>,
    /// Encoded envelope.
    pub body: Vec<u8>,
}

impl Message {
    /// Encodes an envelope, routed by its event type.
    pub fn from_envelope(envelope: &EventEnvelope) -> Result<Self> {
        Self::with_routing_key(envelope.routing_key(), envelope)
    }

    /// Encodes an envelope under an explicit routing key.
    pub fn with_routing_key(routing_key: impl Into<String>, envelope: &EventEnvelope) -> Result<Self> {
        Ok(Self {
            message_id: envelope.event_id,
            correlation_id: envelope.correlation_id.clone(),
            routing_key: routing_key.into(),
            content_type: CONTENT_TYPE_JSON,
            headers: BTreeMap::new(),
            body: events::encode(envelope)?,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Returns the delivery count header, or 0 if the message was never
    /// delivered.
    pub fn delivery_count(&self) -> u32 {
        self.header(DELIVERY_COUNT_HEADER)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}

/// Identifies one delivery on a subscription. Tags are never reused, so an
/// ack for a delivery that has since been requeued is simply ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeliveryTag(pub(crate) u64);

impl DeliveryTag {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message handed to a subscriber, awaiting ack or nack.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub queue: String,
    /// True if the message has been delivered before.
    pub redelivered: bool,
    pub message: Message,
}

impl Delivery {
    /// Number of times this message has been delivered, this delivery included.
    pub fn delivery_count(&self) -> u32 {
        self.message.delivery_count()
    }
}
