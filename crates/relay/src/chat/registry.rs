use std::collections::HashMap;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use parley_common::{protocol::ws::ChatFrame, types::ConnectionId};
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use super::resume::{generate_resume_token, ParkedConnection};
use crate::metrics;

/// Bytes of randomness behind a connection id (20 base64url characters).
const CONNECTION_ID_BYTES: usize = 15;

pub type Outbound = mpsc::UnboundedSender<ChatFrame>;
pub type OutboundReceiver = mpsc::UnboundedReceiver<ChatFrame>;

/// Server-side record of one live client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub connection_id: ConnectionId,
    pub display_name: String,
    /// The transport restored this connection's state; no replay is needed.
    pub recovered: bool,
    /// Highest message id the client claims to have seen.
    pub client_known_offset: i64,
    /// Single-use token that parks this connection when it drops.
    pub resume_token: String,
}

#[derive(Debug)]
struct SessionRecord {
    session: Session,
    outbound: Outbound,
    /// Offset replay has not finished for this session yet.
    replay_pending: bool,
}

/// Frames a dropped socket never wrote, carried over into its parked state.
#[derive(Debug, Default)]
pub struct Undelivered<'a> {
    /// The frame whose socket write failed.
    pub failed: Option<ChatFrame>,
    /// The session's outbound queue, drained once it is no longer live.
    pub queued: Option<&'a mut OutboundReceiver>,
}

#[derive(Debug, Default)]
struct RegistryState {
    live: HashMap<ConnectionId, SessionRecord>,
    /// Dropped connections awaiting resume, keyed by resume token.
    parked: HashMap<String, ParkedConnection>,
}

impl RegistryState {
    fn insert_live(
        &mut self,
        connection_id: ConnectionId,
        recovered: bool,
        client_known_offset: i64,
        outbound: Outbound,
    ) -> Session {
        let session = Session {
            display_name: SessionRegistry::display_name_for(&connection_id),
            connection_id: connection_id.clone(),
            recovered,
            client_known_offset: client_known_offset.max(0),
            resume_token: generate_resume_token(),
        };
        self.live.insert(
            connection_id,
            SessionRecord { session: session.clone(), outbound, replay_pending: !recovered },
        );
        metrics::set_active_sessions(self.live.len());
        session
    }

    fn purge_unresumable(&mut self, now: Instant) {
        self.parked.retain(|_, parked| parked.is_resumable(now));
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("connection {0} is already registered")]
    AlreadyConnected(ConnectionId),
}

/// A parked connection brought back by its resume token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resumed {
    pub session: Session,
    /// Buffered frames pushed into the new outbound channel.
    pub flushed: usize,
}

/// Live sessions of this process, plus dropped connections that may still
/// resume.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    state: RwLock<RegistryState>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn admit(
        &self,
        connection_id: ConnectionId,
        recovered: bool,
        client_known_offset: i64,
        outbound: Outbound,
    ) -> Result<Session, RegistryError> {
        let mut guard = self.state.write().await;
        if guard.live.contains_key(&connection_id) {
            return Err(RegistryError::AlreadyConnected(connection_id));
        }

        Ok(guard.insert_live(connection_id, recovered, client_known_offset, outbound))
    }

    /// Removes the session. Unknown or already released ids yield `None`.
    pub async fn release(&self, connection_id: &ConnectionId) -> Option<Session> {
        let mut guard = self.state.write().await;
        let released = guard.live.remove(connection_id).map(|record| record.session);
        metrics::set_active_sessions(guard.live.len());
        released
    }

    /// Releases the session and parks it under its resume token for `window`.
    ///
    /// The parked buffer starts with `undelivered`: the failed frame first,
    /// then everything still queued for the old socket. Senders only push
    /// into a live session's queue under the registry lock, so nothing lands
    /// between the drain and the parking.
    pub async fn release_for_resume(
        &self,
        connection_id: &ConnectionId,
        window: Duration,
        undelivered: Undelivered<'_>,
    ) -> Option<Session> {
        let now = Instant::now();
        let mut guard = self.state.write().await;
        guard.purge_unresumable(now);

        let record = guard.live.remove(connection_id)?;
        metrics::set_active_sessions(guard.live.len());
        let session = record.session;
        if window.is_zero() {
            return Some(session);
        }

        let mut parked = ParkedConnection::new(session.connection_id.clone(), window, now);
        if record.replay_pending {
            parked.mark_replay_pending();
        }
        if let Some(frame) = undelivered.failed {
            parked.buffer(frame);
        }
        if let Some(queued) = undelivered.queued {
            while let Ok(frame) = queued.try_recv() {
                parked.buffer(frame);
            }
        }

        if parked.has_overflowed() {
            debug!(%connection_id, "undelivered backlog too large, not parking");
        } else {
            guard.parked.insert(session.resume_token.clone(), parked);
        }
        Some(session)
    }

    /// Restores a parked connection: its buffered frames go into `outbound`
    /// first, then the session becomes live with `recovered = true`. A
    /// connection parked before its replay finished comes back with
    /// `recovered = false` so replay runs again from `client_known_offset`.
    ///
    /// Returns `Ok(None)` for unknown, expired, overflowed or already used
    /// tokens.
    pub async fn resume(
        &self,
        resume_token: &str,
        client_known_offset: i64,
        outbound: Outbound,
    ) -> Result<Option<Resumed>, RegistryError> {
        let now = Instant::now();
        let mut guard = self.state.write().await;
        guard.purge_unresumable(now);

        let Some(parked) = guard.parked.remove(resume_token) else {
            debug!("resume token not found or no longer valid");
            return Ok(None);
        };
        if guard.live.contains_key(parked.connection_id()) {
            return Err(RegistryError::AlreadyConnected(parked.connection_id().clone()));
        }

        let connection_id = parked.connection_id().clone();
        let recovered = !parked.needs_replay();
        let mut flushed = 0;
        for frame in parked.into_missed() {
            if outbound.send(frame).is_ok() {
                flushed += 1;
            }
        }

        let session = guard.insert_live(connection_id, recovered, client_known_offset, outbound);
        Ok(Some(Resumed { session, flushed }))
    }

    /// Sends `frame` to every live session; with `buffer_parked`, also
    /// records it for every parked connection. Returns the live recipients.
    pub async fn deliver(&self, frame: &ChatFrame, buffer_parked: bool) -> usize {
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let mut sent_count = 0;
        for record in state.live.values() {
            if record.outbound.send(frame.clone()).is_ok() {
                sent_count += 1;
            }
        }

        if buffer_parked && !state.parked.is_empty() {
            for parked in state.parked.values_mut() {
                parked.buffer(frame.clone());
            }
            state.parked.retain(|_, parked| !parked.has_overflowed());
        }

        sent_count
    }

    /// Sends `frame` to one live session while holding the registry lock.
    pub async fn send_to(&self, connection_id: &ConnectionId, frame: ChatFrame) -> bool {
        let guard = self.state.read().await;
        match guard.live.get(connection_id) {
            Some(record) => record.outbound.send(frame).is_ok(),
            None => false,
        }
    }

    /// Records that offset replay reached the end of the log for `session`.
    /// Ignored once that admission has been released or replaced.
    pub async fn mark_caught_up(&self, session: &Session) {
        let mut guard = self.state.write().await;
        if let Some(record) = guard.live.get_mut(&session.connection_id) {
            if record.session.resume_token == session.resume_token {
                record.replay_pending = false;
            }
        }
    }

    pub fn display_name_for(connection_id: &ConnectionId) -> String {
        connection_id.display_name()
    }

    pub async fn get(&self, connection_id: &ConnectionId) -> Option<Session> {
        self.state.read().await.live.get(connection_id).map(|record| record.session.clone())
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.live.len()
    }

    pub async fn parked_len(&self) -> usize {
        self.state.read().await.parked.len()
    }
}

#[cfg(test)]
impl SessionRegistry {
    pub async fn is_replay_pending(&self, connection_id: &ConnectionId) -> bool {
        self.state.read().await.live.get(connection_id).is_some_and(|record| record.replay_pending)
    }
}

/// Fresh random connection id, URL-safe and 20 characters long.
pub fn generate_connection_id() -> ConnectionId {
    let bytes: [u8; CONNECTION_ID_BYTES] = rand::random();
    ConnectionId::new(URL_SAFE_NO_PAD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use parley_common::{protocol::ws::ChatFrame, types::ConnectionId};
    use tokio::sync::mpsc;

    use super::{generate_connection_id, RegistryError, SessionRegistry, Undelivered};
    use crate::chat::resume::MAX_PARKED_FRAMES;

    const WINDOW: Duration = Duration::from_secs(60);

    fn message(id: i64) -> ChatFrame {
        ChatFrame::Message { content: format!("m{id}"), id: Some(id) }
    }

    #[tokio::test]
    async fn admit_registers_session_with_derived_name() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = ConnectionId::new("abcdefghijklmnopqrst");

        let session = registry.admit(id.clone(), false, 7, tx).await.expect("admit");

        assert_eq!(session.display_name, "abcde");
        assert_eq!(session.client_known_offset, 7);
        assert!(!session.recovered);
        assert!(!session.resume_token.is_empty());
        assert_eq!(registry.get(&id).await, Some(session));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn live_connection_id_cannot_be_admitted_twice() {
        let registry = SessionRegistry::new();
        let id = ConnectionId::new("abcdefghijklmnopqrst");
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();

        registry.admit(id.clone(), false, 0, tx_a).await.expect("first admit");
        let error = registry.admit(id.clone(), true, 0, tx_b).await.expect_err("second admit");
        assert_eq!(error, RegistryError::AlreadyConnected(id.clone()));

        registry.release(&id).await;
        let (tx_c, _rx_c) = mpsc::unbounded_channel();
        assert!(registry.admit(id, true, 0, tx_c).await.is_ok());
    }

    #[tokio::test]
    async fn release_is_idempotent_and_ignores_unknown_ids() {
        let registry = SessionRegistry::new();
        let id = ConnectionId::new("abcdefghijklmnopqrst");
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.admit(id.clone(), false, 0, tx).await.expect("admit");

        assert!(registry.release(&id).await.is_some());
        assert!(registry.release(&id).await.is_none());
        assert!(registry.release(&ConnectionId::new("nobody")).await.is_none());
        assert!(registry.release_for_resume(&id, WINDOW, Undelivered::default()).await.is_none());
        assert_eq!(registry.len().await, 0);
        assert_eq!(registry.parked_len().await, 0);
        assert!(registry.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn negative_offsets_are_treated_as_nothing_seen() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = registry
            .admit(ConnectionId::new("abcdefghijklmnopqrst"), false, -4, tx)
            .await
            .expect("admit");
        assert_eq!(session.client_known_offset, 0);
    }

    #[tokio::test]
    async fn deliver_reaches_only_live_sessions() {
        let registry = SessionRegistry::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = ConnectionId::new("aaaaaaaaaaaaaaaaaaaa");
        let b = ConnectionId::new("bbbbbbbbbbbbbbbbbbbb");
        registry.admit(a, false, 0, tx_a).await.expect("admit a");
        registry.admit(b.clone(), false, 0, tx_b).await.expect("admit b");
        registry.release(&b).await;

        assert_eq!(registry.deliver(&message(1), false).await, 1);
        assert_eq!(rx_a.try_recv().expect("a should receive"), message(1));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn parked_connection_resumes_with_buffered_frames() {
        let registry = SessionRegistry::new();
        let id = ConnectionId::new("abcdefghijklmnopqrst");
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = registry.admit(id.clone(), false, 0, tx).await.expect("admit");
        registry.mark_caught_up(&session).await;

        registry.release_for_resume(&id, WINDOW, Undelivered::default()).await.expect("release");
        registry.deliver(&message(1), true).await;
        registry.deliver(&ChatFrame::Connected { text: "presence".to_string() }, false).await;
        registry.deliver(&message(2), true).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let resumed = registry
            .resume(&session.resume_token, 0, tx)
            .await
            .expect("resume should not conflict")
            .expect("token should be valid");

        assert_eq!(resumed.flushed, 2);
        assert_eq!(resumed.session.connection_id, id);
        assert!(resumed.session.recovered);
        assert_ne!(resumed.session.resume_token, session.resume_token);
        assert_eq!(rx.try_recv().expect("first buffered"), message(1));
        assert_eq!(rx.try_recv().expect("second buffered"), message(2));
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.parked_len().await, 0);
    }

    #[tokio::test]
    async fn queued_and_failed_frames_are_parked_ahead_of_later_broadcasts() {
        let registry = SessionRegistry::new();
        let id = ConnectionId::new("abcdefghijklmnopqrst");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = registry.admit(id.clone(), true, 0, tx).await.expect("admit");

        registry.deliver(&message(1), true).await;
        registry.deliver(&message(2), true).await;
        let failed = rx.try_recv().expect("first frame queued");
        let undelivered = Undelivered { failed: Some(failed), queued: Some(&mut rx) };
        registry.release_for_resume(&id, WINDOW, undelivered).await.expect("release");
        drop(rx);
        registry.deliver(&message(3), true).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let resumed = registry
            .resume(&session.resume_token, 0, tx)
            .await
            .expect("resume should not conflict")
            .expect("token should be valid");

        assert!(resumed.session.recovered);
        assert_eq!(resumed.flushed, 3);
        for expected in 1..=3 {
            assert_eq!(rx.try_recv().expect("buffered frame"), message(expected));
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn connection_parked_mid_replay_resumes_without_recovered_flag() {
        let registry = SessionRegistry::new();
        let id = ConnectionId::new("abcdefghijklmnopqrst");
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = registry.admit(id.clone(), false, 0, tx).await.expect("admit");
        assert!(registry.is_replay_pending(&id).await);

        registry.release_for_resume(&id, WINDOW, Undelivered::default()).await.expect("release");
        let (tx, _rx) = mpsc::unbounded_channel();
        let resumed = registry
            .resume(&session.resume_token, 3, tx)
            .await
            .expect("resume should not conflict")
            .expect("token should be valid");

        assert_eq!(resumed.session.connection_id, id);
        assert!(!resumed.session.recovered);
        assert_eq!(resumed.session.client_known_offset, 3);
        assert!(registry.is_replay_pending(&id).await);
    }

    #[tokio::test]
    async fn caught_up_mark_ignores_replaced_admissions() {
        let registry = SessionRegistry::new();
        let id = ConnectionId::new("abcdefghijklmnopqrst");
        let (tx, _rx) = mpsc::unbounded_channel();
        let first = registry.admit(id.clone(), false, 0, tx).await.expect("admit");
        registry.release(&id).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let second = registry.admit(id.clone(), false, 0, tx).await.expect("admit again");

        registry.mark_caught_up(&first).await;
        assert!(registry.is_replay_pending(&id).await);
        registry.mark_caught_up(&second).await;
        assert!(!registry.is_replay_pending(&id).await);
    }

    #[tokio::test]
    async fn send_to_reaches_only_the_named_live_session() {
        let registry = SessionRegistry::new();
        let id = ConnectionId::new("abcdefghijklmnopqrst");
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.admit(id.clone(), false, 0, tx).await.expect("admit");

        assert!(registry.send_to(&id, message(1)).await);
        assert!(!registry.send_to(&ConnectionId::new("nobody"), message(2)).await);
        registry.release(&id).await;
        assert!(!registry.send_to(&id, message(3)).await);
        assert_eq!(rx.try_recv().expect("sent frame"), message(1));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn resume_tokens_are_single_use() {
        let registry = SessionRegistry::new();
        let id = ConnectionId::new("abcdefghijklmnopqrst");
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = registry.admit(id.clone(), false, 0, tx).await.expect("admit");
        registry.release_for_resume(&id, WINDOW, Undelivered::default()).await;

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(registry.resume(&session.resume_token, 0, tx).await.expect("resume").is_some());
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(registry.resume(&session.resume_token, 0, tx).await.expect("resume").is_none());
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(registry.resume("not-a-token", 0, tx).await.expect("resume").is_none());
    }

    #[tokio::test]
    async fn zero_window_disables_parking() {
        let registry = SessionRegistry::new();
        let id = ConnectionId::new("abcdefghijklmnopqrst");
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = registry.admit(id.clone(), false, 0, tx).await.expect("admit");
        registry
            .release_for_resume(&id, Duration::ZERO, Undelivered::default())
            .await
            .expect("release");

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(registry.resume(&session.resume_token, 0, tx).await.expect("resume").is_none());
    }

    #[tokio::test]
    async fn overflowing_buffer_drops_the_parked_entry() {
        let registry = SessionRegistry::new();
        let id = ConnectionId::new("abcdefghijklmnopqrst");
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = registry.admit(id.clone(), false, 0, tx).await.expect("admit");
        registry.release_for_resume(&id, WINDOW, Undelivered::default()).await;

        for id in 0..=MAX_PARKED_FRAMES as i64 {
            registry.deliver(&message(id), true).await;
        }
        assert_eq!(registry.parked_len().await, 0);

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(registry.resume(&session.resume_token, 0, tx).await.expect("resume").is_none());
    }

    #[test]
    fn generated_ids_are_url_safe_and_unique() {
        let mut seen = HashSet::new();
        for _ in 0..256 {
            let id = generate_connection_id();
            assert_eq!(id.as_str().len(), 20);
            assert!(id
                .as_str()
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
            assert_eq!(SessionRegistry::display_name_for(&id), id.display_name());
            assert!(seen.insert(id));
        }
    }
}
