// Broadcast fanout to the sessions live at call time.

use std::sync::Arc;

use parley_common::{protocol::ws::ChatFrame, types::ConnectionId};
use tracing::debug;

use super::registry::SessionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceKind {
    Joined,
    Left,
}

pub fn presence_text(kind: PresenceKind, display_name: &str) -> String {
    match kind {
        PresenceKind::Joined => format!("User {display_name} joined the chat"),
        PresenceKind::Left => format!("User {display_name} left"),
    }
}

pub fn rendered_message(display_name: &str, text: &str) -> String {
    format!("User {display_name} said: {text}")
}

pub fn delivery_advisory(display_name: &str) -> String {
    format!("Something went wrong! Messages from {display_name} may not have been delivered.")
}

#[derive(Debug, Clone)]
pub struct Fanout {
    registry: Arc<SessionRegistry>,
}

impl Fanout {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Presence is not buffered for parked connections.
    pub async fn broadcast_presence(&self, kind: PresenceKind, display_name: &str) -> usize {
        let text = presence_text(kind, display_name);
        let frame = match kind {
            PresenceKind::Joined => ChatFrame::Connected { text },
            PresenceKind::Left => ChatFrame::Disconnected { text },
        };
        self.registry.deliver(&frame, false).await
    }

    pub async fn broadcast_message(&self, content: &str, id: i64) -> usize {
        let frame = ChatFrame::Message { content: content.to_owned(), id: Some(id) };
        let recipients = self.registry.deliver(&frame, true).await;
        debug!(id, recipients, "message broadcast");
        recipients
    }

    /// Unpersisted notice; carries no id.
    pub async fn broadcast_advisory(&self, content: &str) -> usize {
        let frame = ChatFrame::Message { content: content.to_owned(), id: None };
        self.registry.deliver(&frame, true).await
    }

    /// Sends to one session. `false` when it is no longer live.
    pub async fn notify_one(&self, connection_id: &ConnectionId, frame: ChatFrame) -> bool {
        self.registry.send_to(connection_id, frame).await
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }
}
