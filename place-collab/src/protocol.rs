//! Push frames delivered to live viewers.
//!
//! Every frame travels as one WebSocket text message:
//! ```text
//! {"channel": "Changes", "payload": "[{\"items\":[...],\"sequenceNumber\":42}]"}
//! ```
//!
//! The payload stays an opaque string at this layer. Viewers hand it to
//! [`place_core::decode_changes`] when the channel is [`CHANGES_CHANNEL`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Channel carrying change-log batches.
pub const CHANGES_CHANNEL: &str = "Changes";

/// A message fanned out to every connected viewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushFrame {
    pub channel: String,
    pub payload: Arc<str>,
}

impl PushFrame {
    pub fn new(channel: impl Into<String>, payload: Arc<str>) -> Self {
        Self {
            channel: channel.into(),
            payload,
        }
    }

    /// A frame on the [`CHANGES_CHANNEL`].
    pub fn changes(payload: Arc<str>) -> Self {
        Self::new(CHANGES_CHANNEL, payload)
    }

    pub fn is_changes(&self) -> bool {
        self.channel == CHANGES_CHANNEL
    }

    /// Serialize to the text wire format.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("payload of {size} bytes exceeds the {limit} byte frame limit")]
    PayloadTooLarge { size: usize, limit: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_text_shape() {
        let frame = PushFrame::changes(Arc::from(r#"[{"items":[],"sequenceNumber":1}]"#));
        let text = frame.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["channel"], "Changes");
        assert!(value["payload"].is_string());
    }

    #[test]
    fn test_frame_decode() {
        let frame = PushFrame::decode(r#"{"channel":"Changes","payload":"[]"}"#).unwrap();
        assert!(frame.is_changes());
        assert_eq!(&*frame.payload, "[]");
    }

    #[test]
    fn test_other_channel_is_not_changes() {
        let frame = PushFrame::new("Announcements", Arc::from("hello"));
        assert!(!frame.is_changes());
    }

    #[test]
    fn test_decode_garbage() {
        let err = PushFrame::decode("\u{1}not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
    }
}
