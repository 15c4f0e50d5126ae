//! Event envelope and runtime event wrapper.
//!
//! Events are durable log lines, usually attached to a task. They use
//! the same blob-plus-envelope persistence as tasks and survive the
//! success of the task they describe.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::codec::Codec;
use crate::Result;

/// Envelope kind used for stored event blobs that can no longer be decoded.
pub const LEGACY_EVENT_KIND: &str = "legacy";

/// The serialized form of an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Embedder-defined event tag.
    pub kind: String,
    /// Human-readable description.
    pub description: String,
    /// Opaque embedder payload.
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    /// New envelope.
    pub fn new(
        kind: impl Into<String>,
        description: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            kind: kind.into(),
            description: description.into(),
            payload,
        }
    }
}

/// A durable log line, attached to a task or free-standing.
#[derive(Debug, Clone)]
pub struct Event {
    id: i64,
    envelope: EventEnvelope,
    /// Original bytes of an undecodable stored blob, if this is a
    /// legacy placeholder.
    legacy: Option<Vec<u8>>,
    event_at: Option<DateTime<Local>>,
}

impl Event {
    /// Create a new event from a kind tag, description, and payload.
    pub fn new(
        kind: impl Into<String>,
        description: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: 0,
            envelope: EventEnvelope::new(kind, description, payload),
            legacy: None,
            event_at: None,
        }
    }

    /// Placeholder for a stored blob that can no longer be decoded. The
    /// original bytes are preserved and re-persisted verbatim.
    pub fn legacy(original: Vec<u8>) -> Self {
        Self {
            id: 0,
            envelope: EventEnvelope::new(
                LEGACY_EVENT_KIND,
                "Legacy event placeholder",
                serde_json::Value::Null,
            ),
            legacy: Some(original),
            event_at: None,
        }
    }

    /// Decode a stored blob, falling back to a legacy placeholder.
    pub fn from_blob(blob: &[u8], codec: &dyn Codec) -> Self {
        match codec.decode_event(blob) {
            Ok(envelope) => Self {
                id: 0,
                envelope,
                legacy: None,
                event_at: None,
            },
            Err(err) => Event::legacy(err.bytes),
        }
    }

    /// Serialize this event for storage. Legacy placeholders return
    /// their original bytes unchanged.
    pub fn encode(&self, codec: &dyn Codec) -> Result<Vec<u8>> {
        match &self.legacy {
            Some(original) => Ok(original.clone()),
            None => codec.encode_event(&self.envelope),
        }
    }

    /// Row id, 0 until persisted.
    pub fn id(&self) -> i64 {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    /// Whether this is a placeholder for an undecodable blob.
    pub fn is_legacy(&self) -> bool {
        self.legacy.is_some()
    }

    /// The serialized envelope.
    pub fn envelope(&self) -> &EventEnvelope {
        &self.envelope
    }

    /// Embedder-defined event tag.
    pub fn kind(&self) -> &str {
        &self.envelope.kind
    }

    /// Human-readable description.
    pub fn description(&self) -> &str {
        &self.envelope.description
    }

    /// When the event was recorded, if it has been persisted.
    pub fn event_at(&self) -> Option<DateTime<Local>> {
        self.event_at
    }

    pub(crate) fn set_event_at(&mut self, at: DateTime<Local>) {
        self.event_at = Some(at);
    }
}
