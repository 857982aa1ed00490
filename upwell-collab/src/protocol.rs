//! JSON wire protocol for peer sync.
//!
//! Every frame is one text message:
//! ```text
//! {"method": "OPEN" | "MESSAGE" | "BYE" | "CURSOR",
//!  "peerId": "...", "author": {"id": "...", "name": "..."},
//!  "message": "<base64 sync payload>",      // MESSAGE only
//!  "cursor": {"start": 0, "end": 4}}        // CURSOR only
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use upwell_core::Author;

/// Frame kinds exchanged between peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    /// A peer joined the room and wants a fresh handshake
    Open,
    /// Base64 sync payload
    Message,
    /// A peer is leaving on purpose
    Bye,
    /// Remote cursor or selection
    Cursor,
}

/// Cursor or selection, half-open character range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub start: usize,
    pub end: usize,
}

impl CursorPosition {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn caret(at: usize) -> Self {
        Self { start: at, end: at }
    }

    pub fn is_collapsed(&self) -> bool {
        self.start == self.end
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub method: Method,
    pub peer_id: String,
    pub author: Author,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
}

impl WireMessage {
    fn bare(method: Method, peer_id: &str, author: &Author) -> Self {
        Self {
            method,
            peer_id: peer_id.to_string(),
            author: author.clone(),
            message: None,
            cursor: None,
        }
    }

    pub fn open(peer_id: &str, author: &Author) -> Self {
        Self::bare(Method::Open, peer_id, author)
    }

    pub fn bye(peer_id: &str, author: &Author) -> Self {
        Self::bare(Method::Bye, peer_id, author)
    }

    /// Wrap a binary sync payload.
    pub fn sync(peer_id: &str, author: &Author, payload: &[u8]) -> Self {
        Self {
            message: Some(STANDARD.encode(payload)),
            ..Self::bare(Method::Message, peer_id, author)
        }
    }

    pub fn cursor(peer_id: &str, author: &Author, cursor: CursorPosition) -> Self {
        Self {
            cursor: Some(cursor),
            ..Self::bare(Method::Cursor, peer_id, author)
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    /// Decoded sync payload of a `MESSAGE` frame.
    pub fn payload(&self) -> Result<Vec<u8>, ProtocolError> {
        let encoded = self.message.as_deref().ok_or_else(|| {
            ProtocolError::MalformedMessage(format!(
                "{:?} frame from {} has no payload",
                self.method, self.peer_id
            ))
        })?;
        STANDARD.decode(encoded).map_err(|e| {
            ProtocolError::MalformedMessage(format!(
                "payload from {} is not base64: {e}",
                self.peer_id
            ))
        })
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    /// A frame is missing the field its method requires
    MalformedMessage(String),
    /// The replica rejected a sync payload
    SyncFailed(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::MalformedMessage(e) => write!(f, "Malformed message: {e}"),
            Self::SyncFailed(e) => write!(f, "Sync failed: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<upwell_core::ReplicaError> for ProtocolError {
    fn from(e: upwell_core::ReplicaError) -> Self {
        ProtocolError::SyncFailed(e.to_string())
    }
}
