//! Sequenced payloads emitted on a duplex session.

use serde::{Deserialize, Serialize};

/// A payload positioned within one session's stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Session that produced the message.
    pub session_id: String,
    /// Zero-based position within the session's stream.
    pub sequence: u64,
    /// Opaque payload.
    pub payload: serde_json::Value,
}

impl Message {
    /// Construct a message.
    #[must_use]
    pub fn new(session_id: impl Into<String>, sequence: u64, payload: serde_json::Value) -> Self {
        Self {
            session_id: session_id.into(),
            sequence,
            payload,
        }
    }
}
