// WebSocket message types for the parley-chat.v1 protocol.

use serde::{Deserialize, Serialize};

use crate::types::ConnectionId;

pub const CURRENT_PROTOCOL_VERSION: &str = "parley-chat.v1";
pub const PREVIOUS_PROTOCOL_VERSION: &str = "parley-chat.v0";
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] =
    &[CURRENT_PROTOCOL_VERSION, PREVIOUS_PROTOCOL_VERSION];

#[must_use]
pub fn is_supported_protocol_version(version: &str) -> bool {
    SUPPORTED_PROTOCOL_VERSIONS.contains(&version)
}

/// All message types in the parley-chat.v1 WebSocket protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatFrame {
    /// Client -> Server: initial handshake.
    Hello {
        protocol_version: String,
        /// Highest message id the client has already rendered.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server_offset: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resume_token: Option<String>,
    },

    /// Server -> Client: handshake acknowledgement.
    HelloAck {
        connection_id: ConnectionId,
        display_name: String,
        /// True when the connection state was restored from a resume token
        /// and no offset-based replay will follow.
        recovered: bool,
        /// Token that restores this connection if it drops.
        resume_token: String,
        /// How long after a disconnect the resume token stays valid.
        resume_window_ms: u64,
    },

    /// Client -> Server: a chat line to persist and broadcast.
    Send {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_offset: Option<String>,
    },

    /// Server -> Client: a chat message. `id` is absent on advisory notices
    /// that were never persisted.
    Message {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<i64>,
    },

    /// Server -> Client: acknowledgement of a `send` carrying a client offset.
    Ack {
        client_offset: String,
        id: i64,
        duplicate: bool,
    },

    /// Server -> Client: presence notice for a joining session.
    Connected { text: String },

    /// Server -> Client: presence notice for a leaving session.
    Disconnected { text: String },

    /// Server -> Client: protocol error.
    Error {
        code: String,
        message: String,
        retryable: bool,
    },
}

impl ChatFrame {
    /// Stable frame name used for logging and metric labels.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::HelloAck { .. } => "hello_ack",
            Self::Send { .. } => "send",
            Self::Message { .. } => "message",
            Self::Ack { .. } => "ack",
            Self::Connected { .. } => "connected",
            Self::Disconnected { .. } => "disconnected",
            Self::Error { .. } => "error",
        }
    }

    /// Persisted message id carried by this frame, if any.
    pub fn message_id(&self) -> Option<i64> {
        match self {
            Self::Message { id, .. } => *id,
            _ => None,
        }
    }
}
