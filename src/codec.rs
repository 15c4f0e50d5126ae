//! Pluggable payload serialization.
//!
//! Task and event payloads are persisted as opaque byte blobs. The
//! [`Codec`] trait lets embedders pick the wire format; [`JsonCodec`] is
//! the default. A blob that cannot be decoded surfaces a [`DecodeError`]
//! carrying the original bytes so callers can substitute a legacy
//! placeholder without losing data.

use crate::event::EventEnvelope;
use crate::task::TaskEnvelope;
use crate::Result;

/// A stored blob could not be turned back into an envelope.
///
/// Carries the undecodable bytes so they can be preserved verbatim.
#[derive(Debug)]
pub struct DecodeError {
    /// The original stored bytes.
    pub bytes: Vec<u8>,
    /// Human-readable decode failure description.
    pub reason: String,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cannot decode stored blob: {}", self.reason)
    }
}

impl std::error::Error for DecodeError {}

/// Encodes and decodes task/event envelopes to and from byte blobs.
pub trait Codec: Send + Sync {
    /// Serialize a task envelope.
    fn encode_task(&self, envelope: &TaskEnvelope) -> Result<Vec<u8>>;

    /// Deserialize a task envelope.
    fn decode_task(&self, bytes: &[u8]) -> std::result::Result<TaskEnvelope, DecodeError>;

    /// Serialize an event envelope.
    fn encode_event(&self, envelope: &EventEnvelope) -> Result<Vec<u8>>;

    /// Deserialize an event envelope.
    fn decode_event(&self, bytes: &[u8]) -> std::result::Result<EventEnvelope, DecodeError>;
}

/// Default JSON codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode_task(&self, envelope: &TaskEnvelope) -> Result<Vec<u8>> {
        serde_json::to_vec(envelope).map_err(|e| crate::QueueError::Codec(e.to_string()))
    }

    fn decode_task(&self, bytes: &[u8]) -> std::result::Result<TaskEnvelope, DecodeError> {
        serde_json::from_slice(bytes).map_err(|e| DecodeError {
            bytes: bytes.to_vec(),
            reason: e.to_string(),
        })
    }

    fn encode_event(&self, envelope: &EventEnvelope) -> Result<Vec<u8>> {
        serde_json::to_vec(envelope).map_err(|e| crate::QueueError::Codec(e.to_string()))
    }

    fn decode_event(&self, bytes: &[u8]) -> std::result::Result<EventEnvelope, DecodeError> {
        serde_json::from_slice(bytes).map_err(|e| DecodeError {
            bytes: bytes.to_vec(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskState;

    #[test]
    fn task_envelope_round_trip() {
        let codec = JsonCodec;
        let envelope = TaskEnvelope::new("export", "Export books", serde_json::json!({"n": 3}));

        let bytes = codec.encode_task(&envelope).expect("encode");
        let restored = codec.decode_task(&bytes).expect("decode");

        assert_eq!(restored.kind, "export");
        assert_eq!(restored.description, "Export books");
        assert_eq!(restored.state, TaskState::Created);
        assert_eq!(restored.payload["n"], 3);
    }

    #[test]
    fn encode_is_byte_stable_after_decode() {
        let codec = JsonCodec;
        let envelope = TaskEnvelope::new("sync", "Sync", serde_json::json!({"a": [1, 2]}));
        let bytes = codec.encode_task(&envelope).expect("encode");
        let again = codec
            .encode_task(&codec.decode_task(&bytes).expect("decode"))
            .expect("re-encode");
        assert_eq!(bytes, again);
    }

    #[test]
    fn garbage_blob_yields_decode_error_with_original_bytes() {
        let codec = JsonCodec;
        let blob = vec![0xde, 0xad, 0xbe, 0xef];
        let err = codec.decode_task(&blob).expect_err("must not decode");
        assert_eq!(err.bytes, blob);
        assert!(!err.reason.is_empty());
    }

    #[test]
    fn event_envelope_round_trip() {
        let codec = JsonCodec;
        let envelope = EventEnvelope::new("log", "Sent 3 records", serde_json::json!({"sent": 3}));
        let bytes = codec.encode_event(&envelope).expect("encode");
        let restored = codec.decode_event(&bytes).expect("decode");
        assert_eq!(restored.kind, "log");
        assert_eq!(restored.payload["sent"], 3);
    }
}
