// Offset-based replay of missed messages for a newly admitted session.

use std::sync::Arc;

use futures_util::StreamExt;
use parley_common::protocol::ws::ChatFrame;
use tracing::{debug, error, info, info_span, Instrument};

use super::fanout::{delivery_advisory, Fanout};
use super::registry::Session;
use crate::metrics;
use crate::store::MessageStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The transport restored the session; nothing to replay.
    Skipped,
    Completed,
    /// The session went away mid-replay.
    Cancelled,
    /// A store read failed and the advisory was broadcast.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    pub replayed: u64,
    pub outcome: RecoveryOutcome,
}

impl RecoveryReport {
    fn new(replayed: u64, outcome: RecoveryOutcome) -> Self {
        Self { replayed, outcome }
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    store: Arc<MessageStore>,
    fanout: Fanout,
}

impl RecoveryEngine {
    pub fn new(store: Arc<MessageStore>, fanout: Fanout) -> Self {
        Self { store, fanout }
    }

    /// Sends every message after the session's known offset to that session
    /// only, ascending by id. Best effort: a failed read is reported to the
    /// room once and not retried.
    pub async fn recover(&self, session: &Session) -> RecoveryReport {
        if session.recovered {
            return RecoveryReport::new(0, RecoveryOutcome::Skipped);
        }

        let report = self
            .replay(session)
            .instrument(info_span!(
                "relay.chat.recover",
                connection_id = %session.connection_id,
                from_offset = session.client_known_offset,
            ))
            .await;
        metrics::add_replayed_messages(report.replayed);
        report
    }

    async fn replay(&self, session: &Session) -> RecoveryReport {
        let mut replayed = 0;
        let mut rows = self.store.read_from(session.client_known_offset);

        while let Some(row) = rows.next().await {
            let message = match row {
                Ok(message) => message,
                Err(read_error) => {
                    drop(rows);
                    error!(error = ?read_error, replayed, "replay read failed");
                    metrics::increment_storage_errors();
                    metrics::increment_recovery_failures();
                    self.fanout.broadcast_advisory(&delivery_advisory(&session.display_name)).await;
                    return RecoveryReport::new(replayed, RecoveryOutcome::Failed);
                }
            };

            let frame = ChatFrame::Message { content: message.content, id: Some(message.id) };
            if !self.fanout.notify_one(&session.connection_id, frame).await {
                debug!(replayed, "session released during replay");
                return RecoveryReport::new(replayed, RecoveryOutcome::Cancelled);
            }
            replayed += 1;
        }

        self.fanout.registry().mark_caught_up(session).await;
        if replayed > 0 {
            info!(replayed, "replay completed");
        }
        RecoveryReport::new(replayed, RecoveryOutcome::Completed)
    }
}
