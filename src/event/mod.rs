use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

mod dispatch;
#[cfg(test)]
mod tests;

pub use dispatch::{is_bus_unavailable, DispatchError, Dispatcher};

const SPEC_VERSION: &str = "1.0";
const CONTENT_TYPE_JSON: &str = "application/json";

/// EventEnvelope is the normalized record published to the event bus.
///
/// Every connector payload is wrapped in the same envelope regardless of
/// where it came from. The payload itself is opaque raw bytes.
#[derive(Clone, Debug, PartialEq)]
pub struct EventEnvelope {
    /// Unique per dispatched message (random UUID unless overridden)
    pub id: String,

    /// Connector type (e.g., "webhook", "github")
    pub event_type: String,

    /// Event source name
    pub source: String,

    /// Event name within the event source
    pub subject: String,

    /// Time the envelope was sealed
    pub time: DateTime<Utc>,

    /// Raw bytes emitted by the connector
    pub payload: Vec<u8>,
}

/// Options a connector attaches before the envelope is sealed.
#[derive(Clone, Debug, PartialEq)]
pub enum EventOption {
    /// Use this id instead of a generated one (e.g. an upstream delivery id).
    Id(String),
}

/// Envelope construction errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("event id override must not be empty")]
    EmptyId,
    #[error("event type is required")]
    MissingType,
    #[error("event source is required")]
    MissingSource,
    #[error("event subject is required")]
    MissingSubject,
}

/// JSON form of the envelope on the bus.
///
/// JSON payloads are embedded as `data`; anything else is carried as
/// `data_base64`.
#[derive(Debug, Serialize, Deserialize)]
struct WireEvent {
    specversion: String,
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    source: String,
    subject: String,
    time: DateTime<Utc>,
    datacontenttype: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    data_base64: Option<String>,
}

impl EventEnvelope {
    /// Builds an envelope for one connector message.
    ///
    /// A random id and the current time are assigned, then `options` are
    /// applied in order.
    pub fn build(
        event_type: &str,
        source: &str,
        subject: &str,
        payload: Vec<u8>,
        options: &[EventOption],
    ) -> Result<Self, EnvelopeError> {
        if event_type.is_empty() {
            return Err(EnvelopeError::MissingType);
        }
        if source.is_empty() {
            return Err(EnvelopeError::MissingSource);
        }
        if subject.is_empty() {
            return Err(EnvelopeError::MissingSubject);
        }

        let mut envelope = Self {
            id: generate_event_id(),
            event_type: event_type.to_string(),
            source: source.to_string(),
            subject: subject.to_string(),
            time: Utc::now(),
            payload,
        };

        for option in options {
            match option {
                EventOption::Id(id) if id.is_empty() => return Err(EnvelopeError::EmptyId),
                EventOption::Id(id) => envelope.id = id.clone(),
            }
        }

        Ok(envelope)
    }

    /// Serializes the envelope for the bus.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        let (data, data_base64) = match serde_json::from_slice::<Value>(&self.payload) {
            Ok(value) => (Some(value), None),
            Err(_) => (
                None,
                Some(base64::engine::general_purpose::STANDARD.encode(&self.payload)),
            ),
        };

        let wire = WireEvent {
            specversion: SPEC_VERSION.to_string(),
            id: self.id.clone(),
            event_type: self.event_type.clone(),
            source: self.source.clone(),
            subject: self.subject.clone(),
            time: self.time,
            datacontenttype: CONTENT_TYPE_JSON.to_string(),
            data,
            data_base64,
        };
        serde_json::to_vec(&wire)
    }

    /// Decodes an envelope previously produced by [`EventEnvelope::to_json`].
    ///
    /// JSON payloads come back re-serialized, so whitespace is not preserved.
    pub fn from_json(bytes: &[u8]) -> anyhow::Result<Self> {
        let wire: WireEvent = serde_json::from_slice(bytes)?;
        let payload = match (wire.data, wire.data_base64) {
            (Some(value), _) => serde_json::to_vec(&value)?,
            (None, Some(encoded)) => base64::engine::general_purpose::STANDARD.decode(encoded)?,
            (None, None) => Vec::new(),
        };
        Ok(Self {
            id: wire.id,
            event_type: wire.event_type,
            source: wire.source,
            subject: wire.subject,
            time: wire.time,
            payload,
        })
    }
}

/// Random event id: UUIDv4 as 32 lowercase hex characters.
pub fn generate_event_id() -> String {
    Uuid::new_v4().simple().to_string()
}
