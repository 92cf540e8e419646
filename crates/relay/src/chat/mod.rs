// Chat room service: sessions, durable messages, replay and broadcast.

pub mod fanout;
pub mod recovery;
pub mod registry;
pub mod resume;

use std::sync::Arc;
use std::time::Duration;

use parley_common::types::ConnectionId;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use self::fanout::{delivery_advisory, rendered_message, Fanout, PresenceKind};
use self::recovery::{RecoveryEngine, RecoveryReport};
use self::registry::{
    generate_connection_id, Outbound, RegistryError, Resumed, Session, SessionRegistry,
};
pub use self::registry::Undelivered;
use crate::metrics;
use crate::store::{AppendOutcome, MessageStore};

/// Fresh ids are random; a collision with a live id is retried this often.
const MAX_ADMIT_ATTEMPTS: usize = 3;

#[derive(Debug)]
pub struct ConnectRequest {
    /// Highest message id the client has rendered; 0 when unknown.
    pub server_offset: i64,
    pub resume_token: Option<String>,
    pub outbound: Outbound,
}

#[derive(Debug)]
pub struct Connected {
    pub session: Session,
    /// Replay task; `None` when the transport restored the session.
    pub recovery: Option<JoinHandle<RecoveryReport>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Broadcast { id: i64 },
    /// Already stored under `id`; not broadcast again.
    Duplicate { id: i64 },
    /// The store rejected the write; the advisory went out instead.
    Failed,
    UnknownSession,
}

impl SubmitOutcome {
    /// Id to acknowledge to the sender, if the message is durable.
    pub fn acknowledged_id(self) -> Option<(i64, bool)> {
        match self {
            Self::Broadcast { id } => Some((id, false)),
            Self::Duplicate { id } => Some((id, true)),
            Self::Failed | Self::UnknownSession => None,
        }
    }
}

/// Single owner of the store, the registry and everything built on them.
/// Built once at startup and shared as `Arc<ChatService>`.
#[derive(Debug)]
pub struct ChatService {
    store: Arc<MessageStore>,
    registry: Arc<SessionRegistry>,
    fanout: Fanout,
    recovery: RecoveryEngine,
    recovery_window: Duration,
}

impl ChatService {
    pub fn new(store: Arc<MessageStore>, recovery_window: Duration) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let fanout = Fanout::new(Arc::clone(&registry));
        let recovery = RecoveryEngine::new(Arc::clone(&store), fanout.clone());
        Self { store, registry, fanout, recovery, recovery_window }
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn recovery_window(&self) -> Duration {
        self.recovery_window
    }

    /// Admits a connection, resuming its parked state when the token is
    /// still valid, announces it and starts replay when needed.
    pub async fn connect(&self, request: ConnectRequest) -> Result<Connected, RegistryError> {
        let ConnectRequest { server_offset, resume_token, outbound } = request;

        let resumed = match resume_token {
            Some(token) => match self.registry.resume(&token, server_offset, outbound.clone()).await
            {
                Ok(resumed) => resumed,
                Err(conflict) => {
                    warn!(error = %conflict, "resume rejected, assigning a fresh connection id");
                    None
                }
            },
            None => None,
        };

        let session = match resumed {
            Some(Resumed { session, flushed }) => {
                metrics::increment_transport_resumes();
                info!(connection_id = %session.connection_id, flushed, "connection resumed");
                session
            }
            None => self.admit_fresh(server_offset, outbound).await?,
        };

        self.fanout.broadcast_presence(PresenceKind::Joined, &session.display_name).await;

        let recovery = (!session.recovered).then(|| {
            let engine = self.recovery.clone();
            let session = session.clone();
            tokio::spawn(async move { engine.recover(&session).await })
        });

        Ok(Connected { session, recovery })
    }

    async fn admit_fresh(
        &self,
        server_offset: i64,
        outbound: Outbound,
    ) -> Result<Session, RegistryError> {
        let mut attempt = 1;
        loop {
            let connection_id = generate_connection_id();
            match self.registry.admit(connection_id, false, server_offset, outbound.clone()).await {
                Ok(session) => {
                    info!(
                        connection_id = %session.connection_id,
                        server_offset = session.client_known_offset,
                        "connection admitted"
                    );
                    return Ok(session);
                }
                Err(conflict) if attempt < MAX_ADMIT_ATTEMPTS => {
                    debug!(error = %conflict, attempt, "connection id collision");
                    attempt += 1;
                }
                Err(conflict) => return Err(conflict),
            }
        }
    }

    /// Persists `text` from the session and broadcasts it with its id.
    pub async fn submit(
        &self,
        connection_id: &ConnectionId,
        text: &str,
        client_offset: Option<&str>,
    ) -> SubmitOutcome {
        let Some(session) = self.registry.get(connection_id).await else {
            debug!(%connection_id, "submit from unknown session ignored");
            return SubmitOutcome::UnknownSession;
        };

        let content = rendered_message(&session.display_name, text);
        match self.store.append(&content, client_offset).await {
            Ok(AppendOutcome::Appended(message)) => {
                metrics::record_message_appended(message.id);
                self.fanout.broadcast_message(&message.content, message.id).await;
                SubmitOutcome::Broadcast { id: message.id }
            }
            Ok(AppendOutcome::Duplicate { id }) => {
                metrics::increment_duplicate_submissions();
                debug!(%connection_id, id, "duplicate submission suppressed");
                SubmitOutcome::Duplicate { id }
            }
            Err(store_error) => {
                error!(%connection_id, error = ?store_error, "message append failed");
                metrics::increment_storage_errors();
                self.fanout.broadcast_advisory(&delivery_advisory(&session.display_name)).await;
                SubmitOutcome::Failed
            }
        }
    }

    /// Releases the session, parks it for resume together with the frames
    /// its socket never wrote, and announces the leave. Unknown or already
    /// released ids are ignored.
    pub async fn disconnect(
        &self,
        connection_id: &ConnectionId,
        undelivered: Undelivered<'_>,
    ) -> Option<Session> {
        let session = if self.recovery_window.is_zero() {
            self.registry.release(connection_id).await?
        } else {
            self.registry
                .release_for_resume(connection_id, self.recovery_window, undelivered)
                .await?
        };
        self.fanout.broadcast_presence(PresenceKind::Left, &session.display_name).await;
        info!(%connection_id, "connection released");
        Some(session)
    }
}
