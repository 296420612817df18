//! The closed registry of event tags and the wire codec.
//!
//! Adding an event type means adding a payload struct, an [`Event`] variant
//! and an [`EventType`] variant; the exhaustive matches below will not compile
//! until every arm is filled in.

use chrono::{DateTime, Utc};
use common::CorrelationId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::envelope::{EventEnvelope, EventId};
use crate::error::{CodecError, Result};
use crate::payload::Event;

/// Event type tags. The tag string is also the transport routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventType {
    OrderCreated,
    OrderConfirmed,
    OrderCancelled,
    InventoryReserved,
    InventoryReleased,
    InventoryInsufficient,
    PaymentProcessed,
    PaymentFailed,
}

impl EventType {
    /// Every registered event type.
    pub const ALL: [EventType; 8] = [
        EventType::OrderCreated,
        EventType::OrderConfirmed,
        EventType::OrderCancelled,
        EventType::InventoryReserved,
        EventType::InventoryReleased,
        EventType::InventoryInsufficient,
        EventType::PaymentProcessed,
        EventType::PaymentFailed,
    ];

    /// Returns the wire tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::OrderCreated => "order.created",
            EventType::OrderConfirmed => "order.confirmed",
            EventType::OrderCancelled => "order.cancelled",
            EventType::InventoryReserved => "inventory.reserved",
            EventType::InventoryReleased => "inventory.released",
            EventType::InventoryInsufficient => "inventory.insufficient",
            EventType::PaymentProcessed => "payment.processed",
            EventType::PaymentFailed => "payment.failed",
        }
    }

    /// Looks up a wire tag in the registry.
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == tag)
    }

    /// Decodes a raw payload for this event type.
    pub fn decode(&self, raw: serde_json::Value) -> Result<Event> {
        match self {
            EventType::OrderCreated => self.payload(raw).map(Event::OrderCreated),
            EventType::OrderConfirmed => self.payload(raw).map(Event::OrderConfirmed),
            EventType::OrderCancelled => self.payload(raw).map(Event::OrderCancelled),
            EventType::InventoryReserved => self.payload(raw).map(Event::InventoryReserved),
            EventType::InventoryReleased => self.payload(raw).map(Event::InventoryReleased),
            EventType::InventoryInsufficient => {
                self.payload(raw).map(Event::InventoryInsufficient)
            }
            EventType::PaymentProcessed => self.payload(raw).map(Event::PaymentProcessed),
            EventType::PaymentFailed => self.payload(raw).map(Event::PaymentFailed),
        }
    }

    fn payload<T: DeserializeOwned>(&self, raw: serde_json::Value) -> Result<T> {
        serde_json::from_value(raw).map_err(|e| CodecError::MalformedPayload {
            event_type: self.as_str().to_string(),
            reason: e.to_string(),
        })
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_tag(s).ok_or_else(|| CodecError::UnknownEventType(s.to_string()))
    }
}

/// Decodes a raw payload by tag.
pub fn decode(event_type: &str, raw: serde_json::Value) -> Result<Event> {
    event_type.parse::<EventType>()?.decode(raw)
}

#[derive(Serialize)]
struct WireEnvelopeRef<'a> {
    event_id: EventId,
    event_type: &'static str,
    timestamp: DateTime<Utc>,
    correlation_id: &'a CorrelationId,
    payload: &'a Event,
}

#[derive(Deserialize)]
struct WireEnvelope {
    event_id: EventId,
    event_type: String,
    timestamp: DateTime<Utc>,
    correlation_id: CorrelationId,
    payload: serde_json::Value,
}

/// Serializes an envelope to its JSON wire form.
pub fn encode(envelope: &EventEnvelope) -> Result<Vec<u8>> {
    let wire = WireEnvelopeRef {
        event_id: envelope.event_id,
        event_type: envelope.event_type().as_str(),
        timestamp: envelope.timestamp,
        correlation_id: &envelope.correlation_id,
        payload: &envelope.payload,
    };
    Ok(serde_json::to_vec(&wire)?)
}

/// Parses a JSON wire envelope and decodes its payload by tag.
pub fn decode_envelope(bytes: &[u8]) -> Result<EventEnvelope> {
    let wire: WireEnvelope =
        serde_json::from_slice(bytes).map_err(|e| CodecError::MalformedEnvelope(e.to_string()))?;
    let payload = decode(&wire.event_type, wire.payload)?;

    Ok(EventEnvelope {
        event_id: wire.event_id,
        timestamp: wire.timestamp,
        correlation_id: wire.correlation_id,
        payload,
    })
}
