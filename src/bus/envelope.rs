//! Event envelope: the only schema exchanged over the wire.
//!
//! ```json
//! { "type": "identity.registered",
//!   "payload": { "id": "u1", ... },
//!   "occurredAt": "2024-01-01T00:00:00Z",
//!   "metadata": { "version": 1 } }
//! ```
//!
//! The envelope is shared by every hop of the propagation chain and is generic
//! over the payload shape, so producers and consumers agree on the wrapper even
//! when they model the payload differently.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Media type of an encoded envelope.
pub const CONTENT_TYPE: &str = "application/json";

/// Payload schema version written when none is specified.
pub const DEFAULT_SCHEMA_VERSION: u32 = 1;

/// Untyped payload: a JSON object.
pub type Payload = Map<String, Value>;

/// Envelope metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    /// Payload schema version.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Identifier shared by every event caused by the same originating request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Identifier of the event or request that directly caused this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
}

fn default_version() -> u32 {
    DEFAULT_SCHEMA_VERSION
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self {
            version: DEFAULT_SCHEMA_VERSION,
            correlation_id: None,
            causation_id: None,
        }
    }
}

/// A published fact.
///
/// `event_type` doubles as the routing key. Handlers receive envelopes behind
/// an `Arc`, so nothing can mutate one in transit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope<P = Payload> {
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: P,
    /// Producer-assigned event time. `occuredAt` is accepted from older producers.
    #[serde(alias = "occuredAt")]
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: EventMetadata,
}

impl<P> EventEnvelope<P> {
    /// Create an envelope stamped with the current time and schema version 1.
    pub fn new(event_type: impl Into<String>, payload: P) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            occurred_at: Utc::now(),
            metadata: EventMetadata::default(),
        }
    }

    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.metadata.version = version;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.metadata.correlation_id = correlation_id;
        self
    }

    pub fn with_causation_id(mut self, causation_id: Option<String>) -> Self {
        self.metadata.causation_id = causation_id;
        self
    }
}

impl<P: Serialize> EventEnvelope<P> {
    /// Encode to the canonical compact JSON byte form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl<P: DeserializeOwned> EventEnvelope<P> {
    /// Decode from a message body.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

impl EventEnvelope<Payload> {
    /// The stable subject id carried in `payload.id`, if present.
    pub fn subject_id(&self) -> Option<&str> {
        self.payload.get("id").and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registered() -> EventEnvelope {
        let payload = json!({"id": "u1", "email": "a@b.com", "displayName": "A"});
        EventEnvelope::new("identity.registered", payload.as_object().cloned().unwrap())
            .with_occurred_at("2024-01-01T00:00:00Z".parse().unwrap())
    }

    #[test]
    fn test_wire_field_names() {
        let bytes = registered().to_bytes().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(value["type"], "identity.registered");
        assert_eq!(value["payload"]["displayName"], "A");
        assert_eq!(value["metadata"]["version"], 1);
        assert!(value.get("occurredAt").is_some());
        assert!(value["metadata"].get("correlationId").is_none());
    }

    #[test]
    fn test_round_trip_preserves_type_payload_and_version() {
        let original = registered().with_version(3);
        let decoded = EventEnvelope::<Payload>::from_slice(&original.to_bytes().unwrap()).unwrap();

        assert_eq!(decoded.event_type, original.event_type);
        assert_eq!(decoded.payload, original.payload);
        assert_eq!(decoded.metadata.version, 3);
        assert_eq!(decoded.occurred_at, original.occurred_at);
    }

    #[test]
    fn test_missing_metadata_defaults_to_version_one() {
        let raw = br#"{"type":"identity.registered","payload":{"id":"u1"},"occurredAt":"2024-01-01T00:00:00Z"}"#;
        let decoded = EventEnvelope::<Payload>::from_slice(raw).unwrap();
        assert_eq!(decoded.metadata, EventMetadata::default());
        assert_eq!(decoded.subject_id(), Some("u1"));
    }

    #[test]
    fn test_accepts_legacy_occured_at_spelling() {
        let raw = br#"{"type":"auth.user.registered","payload":{"id":"u1"},"occuredAt":"2024-01-01T00:00:00.000Z","metadata":{"version":1}}"#;
        let decoded = EventEnvelope::<Payload>::from_slice(raw).unwrap();
        assert_eq!(decoded.occurred_at.to_rfc3339(), "2024-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_non_object_payload_is_rejected() {
        let raw = br#"{"type":"identity.registered","payload":[1,2],"occurredAt":"2024-01-01T00:00:00Z"}"#;
        assert!(EventEnvelope::<Payload>::from_slice(raw).is_err());
    }

    #[test]
    fn test_malformed_body_is_rejected() {
        assert!(EventEnvelope::<Payload>::from_slice(b"not json").is_err());
    }

    #[test]
    fn test_correlation_metadata_round_trips() {
        let envelope = registered().with_correlation_id(Some("req-7".to_string()));
        let decoded = EventEnvelope::<Payload>::from_slice(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.metadata.correlation_id.as_deref(), Some("req-7"));
        assert_eq!(decoded.metadata.causation_id, None);
    }
}
