// Transport-level connection state recovery.
//
// A dropped connection is parked under its resume token for the recovery
// window. Broadcast messages are buffered for it meanwhile; a client that
// comes back in time gets its old connection id and the buffered frames,
// and skips offset-based replay.

use std::time::{Duration, Instant};

use parley_common::{protocol::ws::ChatFrame, types::ConnectionId};
use uuid::Uuid;

/// Buffered frames per parked connection before the entry is discarded.
pub const MAX_PARKED_FRAMES: usize = 1024;

#[derive(Debug)]
pub struct ParkedConnection {
    connection_id: ConnectionId,
    expires_at: Instant,
    missed: Vec<ChatFrame>,
    overflowed: bool,
    replay_pending: bool,
}

impl ParkedConnection {
    pub fn new(connection_id: ConnectionId, window: Duration, now: Instant) -> Self {
        Self {
            connection_id,
            expires_at: now + window,
            missed: Vec::new(),
            overflowed: false,
            replay_pending: false,
        }
    }

    /// The connection dropped before offset replay finished.
    pub fn mark_replay_pending(&mut self) {
        self.replay_pending = true;
    }

    pub fn needs_replay(&self) -> bool {
        self.replay_pending
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn buffer(&mut self, frame: ChatFrame) {
        if self.overflowed {
            return;
        }
        if self.missed.len() >= MAX_PARKED_FRAMES {
            // Offset replay from the store covers this client instead.
            self.overflowed = true;
            self.missed = Vec::new();
            return;
        }
        self.missed.push(frame);
    }

    pub fn has_overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn is_resumable(&self, now: Instant) -> bool {
        !self.overflowed && now < self.expires_at
    }

    pub fn missed_len(&self) -> usize {
        self.missed.len()
    }

    pub fn into_missed(self) -> Vec<ChatFrame> {
        self.missed
    }
}

pub fn generate_resume_token() -> String {
    Uuid::new_v4().to_string()
}
