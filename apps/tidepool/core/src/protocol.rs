//! JSON messages exchanged over the per-connection WebSocket.
//!
//! Frames are adjacently tagged: `{"type": "checkbox-update", "data": {...}}`.
//! Indices travel as signed integers so that a negative value still decodes
//! and is rejected by domain validation rather than by the parser.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

/// Longest chat message, in characters, accepted by default.
pub const DEFAULT_MAX_CHAT_LEN: usize = 100;

/// Messages sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    GetInitialState,
    RequestCheckboxChunk(i64),
    CheckboxUpdate(CheckboxUpdate),
    ChatMessage(String),
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    InitialState(InitialState),
    CheckboxChunk(CheckboxChunk),
    CheckboxUpdate(CheckboxUpdate),
    ChatMessage(ChatBroadcast),
    ChatError(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialState {
    pub count_true: u64,
    pub domain_size: u64,
    /// Full list of true indices; only present for small domains.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checked_boxes: Option<Vec<u64>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckboxChunk {
    pub chunk_index: i64,
    /// True indices relative to the chunk start.
    pub checked_boxes: Vec<u64>,
}

/// A toggle request (client to server) or its authoritative echo (server to
/// every client, carrying `total_checked`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckboxUpdate {
    pub index: i64,
    pub checked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_checked: Option<u64>,
}

impl CheckboxUpdate {
    /// Indices beyond `i64::MAX` saturate so the server rejects them as out of
    /// domain instead of reading a wrapped negative.
    pub fn request(index: u64, checked: bool) -> Self {
        Self {
            index: i64::try_from(index).unwrap_or(i64::MAX),
            checked,
            total_checked: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatBroadcast {
    pub user_id: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("invalid frame: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("binary frame is not valid UTF-8")]
    NotUtf8,
}

impl ClientMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        encode_frame(self)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        decode_frame(text)
    }

    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::NotUtf8)?;
        decode_frame(text)
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        encode_frame(self)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        decode_frame(text)
    }
}

/// Chat length as users count it: characters, not bytes.
pub fn chat_len(text: &str) -> usize {
    text.chars().count()
}

fn encode_frame<T: Serialize>(message: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(message).map_err(ProtocolError::Encode)
}

fn decode_frame<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(text).map_err(ProtocolError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn client_frames_use_wire_names() {
        let get = serde_json::to_value(ClientMessage::GetInitialState).unwrap();
        assert_eq!(get, json!({ "type": "get-initial-state" }));

        let chunk = serde_json::to_value(ClientMessage::RequestCheckboxChunk(7)).unwrap();
        assert_eq!(chunk, json!({ "type": "request-checkbox-chunk", "data": 7 }));

        let update =
            serde_json::to_value(ClientMessage::CheckboxUpdate(CheckboxUpdate::request(5, true)))
                .unwrap();
        assert_eq!(
            update,
            json!({ "type": "checkbox-update", "data": { "index": 5, "checked": true } })
        );
    }

    #[test_timeout::timeout]
    fn server_frames_use_camel_case_payloads() {
        let initial = ServerMessage::InitialState(InitialState {
            count_true: 2,
            domain_size: 100,
            checked_boxes: None,
        });
        assert_eq!(
            serde_json::to_value(&initial).unwrap(),
            json!({ "type": "initial-state", "data": { "countTrue": 2, "domainSize": 100 } })
        );

        let chat = ServerMessage::ChatMessage(ChatBroadcast {
            user_id: "AB12".into(),
            message: "hi".into(),
        });
        assert_eq!(
            serde_json::to_value(&chat).unwrap(),
            json!({ "type": "chat-message", "data": { "userId": "AB12", "message": "hi" } })
        );

        let chunk = ServerMessage::CheckboxChunk(CheckboxChunk {
            chunk_index: 3,
            checked_boxes: vec![0, 9],
        });
        assert_eq!(
            serde_json::to_value(&chunk).unwrap(),
            json!({ "type": "checkbox-chunk", "data": { "chunkIndex": 3, "checkedBoxes": [0, 9] } })
        );
    }

    #[test_timeout::timeout]
    fn negative_index_still_decodes() {
        let msg = ClientMessage::decode(
            r#"{"type":"checkbox-update","data":{"index":-4,"checked":true}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::CheckboxUpdate(CheckboxUpdate {
                index: -4,
                checked: true,
                total_checked: None,
            })
        );
    }

    #[test_timeout::timeout]
    fn oversized_request_index_saturates() {
        assert_eq!(CheckboxUpdate::request(u64::MAX, true).index, i64::MAX);
        assert_eq!(CheckboxUpdate::request(1 << 63, false).index, i64::MAX);
        assert_eq!(CheckboxUpdate::request(42, true).index, 42);
    }

    #[test_timeout::timeout]
    fn malformed_frames_are_errors() {
        assert!(matches!(
            ClientMessage::decode(r#"{"type":"explode"}"#),
            Err(ProtocolError::Decode(_))
        ));
        assert!(matches!(
            ClientMessage::decode_bytes(&[0xff, 0xfe]),
            Err(ProtocolError::NotUtf8)
        ));
    }

    #[test_timeout::timeout]
    fn chat_len_counts_characters() {
        assert_eq!(chat_len("héllo"), 5);
        assert_eq!(chat_len(&"é".repeat(100)), 100);
    }
}
