// Protocol version negotiation and N-1 support.
//
// Clients send a protocol version string (e.g. "parley-chat.v1") in their
// hello frame. The server rejects unsupported versions with an
// UPGRADE_REQUIRED error frame and closes the socket.

use crate::error::{ErrorCode, RelayError};
use parley_common::protocol::ws::{
    is_supported_protocol_version, CURRENT_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};
use serde_json::json;

/// The current (latest) protocol version.
pub const CURRENT_VERSION: &str = "parley-chat.v1";

/// Returns the list of supported protocol versions (newest first).
pub fn supported_versions() -> &'static [&'static str] {
    SUPPORTED_PROTOCOL_VERSIONS
}

/// Validates a client-supplied protocol version. Returns a `RelayError`
/// with code `UPGRADE_REQUIRED` and `details.supported_versions` if the
/// version is unknown.
pub fn require_supported(version: &str) -> Result<(), RelayError> {
    if is_supported_protocol_version(version) {
        Ok(())
    } else {
        Err(RelayError::new(
            ErrorCode::UpgradeRequired,
            format!("unsupported protocol version: {version}"),
        )
        .with_details(json!({
            "requested_version": version,
            "supported_versions": SUPPORTED_PROTOCOL_VERSIONS,
            "current_version": CURRENT_PROTOCOL_VERSION,
        })))
    }
}
