mod handler;
mod protocol;

use std::sync::Arc;

use axum::{routing::get, Router};

use crate::chat::ChatService;

pub(crate) const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub(crate) const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
pub(crate) const MAX_FRAME_BYTES: usize = 65_536;

pub fn router(service: Arc<ChatService>) -> Router {
    Router::new().route("/v1/ws", get(handler::ws_upgrade)).with_state(service)
}
