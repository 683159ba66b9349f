//! Core types for pgtxq: queued messages and producer input.
//!
//! [`Message`] is a row of the message table; [`NewMessage`] is what a
//! producer hands to [`crate::Producer::produce`] before the engine fills in
//! defaults.

use crate::constants::STATUS_WAIT;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A message in the queue.
///
/// The lifecycle is a small state machine on `status`:
/// wait (the empty string) may transition to itself any number of times via
/// retries, then once to `done` or `givenUp`. Each transition bumps
/// `try_count`; terminal rows are never dispatched again and are eventually
/// deleted by the cleaner.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    /// Unique message ID, assigned by the database
    pub id: i64,
    /// Name of the logical queue this message belongs to
    pub queue: String,
    /// Lifecycle status; one of the `STATUS_*` constants
    pub status: String,
    /// Timestamp of first insertion
    pub created_at: DateTime<Utc>,
    /// Number of delivery attempts recorded so far
    pub try_count: i16,
    /// Earliest instant at which the message is eligible to be claimed
    pub retry_at: DateTime<Utc>,
    /// Opaque JSON payload
    pub data: serde_json::Value,
}

impl Message {
    /// Whether the message is still waiting to be consumed.
    pub fn is_waiting(&self) -> bool {
        self.status == STATUS_WAIT
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message {{ id: {}, queue: {}, status: {:?}, try_count: {}, retry_at: {}, data: {} }}",
            self.id, self.queue, self.status, self.try_count, self.retry_at, self.data
        )
    }
}

/// Input for producing a new message.
///
/// `created_at` and `retry_at` are optional; the engine fills them at insert
/// time (`created_at` with the current instant, `retry_at` with `created_at`)
/// so a plain `NewMessage::new(queue, &payload)` is immediately eligible.
#[derive(Debug, Clone)]
pub struct NewMessage {
    /// Name of the logical queue; must be non-empty
    pub queue: String,
    /// JSON payload
    pub data: serde_json::Value,
    /// Insertion timestamp override
    pub created_at: Option<DateTime<Utc>>,
    /// First-eligibility override, for delayed messages
    pub retry_at: Option<DateTime<Utc>>,
}

impl NewMessage {
    /// Create a message by serializing `payload` to JSON.
    ///
    /// Fails with [`crate::Error::Serialization`] when the payload cannot be
    /// encoded.
    pub fn new<S, T>(queue: S, payload: &T) -> Result<Self>
    where
        S: Into<String>,
        T: Serialize + ?Sized,
    {
        Ok(Self {
            queue: queue.into(),
            data: serde_json::to_value(payload)?,
            created_at: None,
            retry_at: None,
        })
    }

    /// Create a message from pre-serialized JSON bytes.
    ///
    /// The bytes are parsed up front so invalid JSON fails here rather than
    /// at the database.
    pub fn from_json_bytes<S: Into<String>>(queue: S, payload: &[u8]) -> Result<Self> {
        Ok(Self {
            queue: queue.into(),
            data: serde_json::from_slice(payload)?,
            created_at: None,
            retry_at: None,
        })
    }

    /// Delay first delivery until `retry_at`.
    pub fn with_retry_at(mut self, retry_at: DateTime<Utc>) -> Self {
        self.retry_at = Some(retry_at);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_message_serializes_payload() {
        let msg = NewMessage::new("email", &json!({"to": "a@b"})).unwrap();
        assert_eq!(msg.queue, "email");
        assert_eq!(msg.data["to"], "a@b");
        assert!(msg.created_at.is_none());
        assert!(msg.retry_at.is_none());
    }

    #[test]
    fn test_new_message_from_struct() {
        #[derive(Serialize)]
        struct Payload {
            id: u32,
        }
        let msg = NewMessage::new("jobs", &Payload { id: 7 }).unwrap();
        assert_eq!(msg.data, json!({"id": 7}));
    }

    #[test]
    fn test_from_json_bytes() {
        let msg = NewMessage::from_json_bytes("email", br#"{"to":"a@b"}"#).unwrap();
        assert_eq!(msg.data, json!({"to": "a@b"}));
    }

    #[test]
    fn test_from_json_bytes_invalid() {
        assert!(NewMessage::from_json_bytes("email", b"not json").is_err());
    }

    #[test]
    fn test_with_retry_at() {
        let at = Utc::now() + chrono::Duration::seconds(30);
        let msg = NewMessage::new("email", &json!({})).unwrap().with_retry_at(at);
        assert_eq!(msg.retry_at, Some(at));
    }

    #[test]
    fn test_message_display_and_waiting() {
        let msg = Message {
            id: 1,
            queue: "email".to_string(),
            status: STATUS_WAIT.to_string(),
            created_at: Utc::now(),
            try_count: 0,
            retry_at: Utc::now(),
            data: json!({"k": "v"}),
        };
        assert!(msg.is_waiting());
        let rendered = msg.to_string();
        assert!(rendered.contains("queue: email"));
        assert!(rendered.contains("id: 1"));
    }
}
