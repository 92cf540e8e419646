// Core domain types shared across Parley crates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of leading connection-id characters shown as the user's name.
pub const DISPLAY_NAME_LEN: usize = 5;

/// Opaque identifier the transport assigns to one client connection.
///
/// A resumed connection keeps its id, so the display name derived from it
/// is stable across a transport-level reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short user-facing name: the first [`DISPLAY_NAME_LEN`] characters.
    pub fn display_name(&self) -> String {
        self.0.chars().take(DISPLAY_NAME_LEN).collect()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}
