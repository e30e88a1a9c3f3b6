use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::AggregateId;

/// The message published for an outbox record.
///
/// Field names are camelCase on the wire; consumers in other services rely
/// on this shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    /// Dotted event name, also the default routing key.
    pub event_type: String,

    /// The decoded event payload.
    pub payload: serde_json::Value,

    /// When the originating outbox record was created.
    pub timestamp: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn builder() -> EventEnvelopeBuilder {
        EventEnvelopeBuilder::default()
    }

    /// Deserializes the payload into a typed event.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Serializes the envelope to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parses an envelope from JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Builder for constructing envelopes by hand, mostly in tests and tools.
#[derive(Debug, Default)]
pub struct EventEnvelopeBuilder {
    aggregate_id: Option<AggregateId>,
    aggregate_type: Option<String>,
    event_type: Option<String>,
    payload: Option<serde_json::Value>,
    timestamp: Option<DateTime<Utc>>,
}

impl EventEnvelopeBuilder {
    pub fn aggregate_id(mut self, id: impl Into<AggregateId>) -> Self {
        self.aggregate_id = Some(id.into());
        self
    }

    pub fn aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Serializes `payload` as the envelope body.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Defaults to now.
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Builds the envelope. Missing identifiers become fresh ids or empty strings.
    pub fn build(self) -> EventEnvelope {
        EventEnvelope {
            aggregate_id: self.aggregate_id.unwrap_or_default(),
            aggregate_type: self.aggregate_type.unwrap_or_default(),
            event_type: self.event_type.unwrap_or_default(),
            payload: self.payload.unwrap_or(serde_json::Value::Null),
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
        }
    }
}
