//! WebSocket wire format: JSON text frames shaped `{"event": ..., "data": ...}`.

use serde::{Deserialize, Serialize};

/// Frames a client may send.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// A prompt to answer within the current conversation.
    UserQuery(String),
    /// Forget the conversation so far.
    NewChat,
}

/// Frames the server sends.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    Response(String),
}

impl ServerEvent {
    pub fn response(text: impl Into<String>) -> Self {
        Self::Response(text.into())
    }
}
