//! Outbound business events.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A structured business message to publish.
///
/// The payload is opaque to the client; schema validation happens outside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Business message id, sent as the transport message id.
    pub message_id: String,

    /// Serialized payload fragment.
    pub payload: Vec<u8>,
}

impl Event {
    /// Create an event with the given business id and payload.
    pub fn new(message_id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            message_id: message_id.into(),
            payload: payload.into(),
        }
    }

    /// Replace the business id with a freshly generated one.
    pub fn with_fresh_message_id(mut self) -> Self {
        self.message_id = Uuid::new_v4().to_string();
        self
    }
}
