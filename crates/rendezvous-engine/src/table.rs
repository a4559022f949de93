use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::time::Instant;

use crate::connection::{PeerConnection, RemoteTrack};
use crate::model::SessionId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    Discovered,
    Negotiating,
    Connected,
    Closing,
    Closed,
    Expired,
}

impl SessionState {
    /// States in which a connection object must exist.
    pub fn holds_connection(self) -> bool {
        matches!(
            self,
            SessionState::Negotiating | SessionState::Connected | SessionState::Closing
        )
    }
}

/// Why a session left the table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The connection reported that the other side went away.
    Remote,
    Failed(String),
    Expired,
    Departed,
    Superseded,
    Renegotiating,
    Local,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &str {
        match self {
            CloseReason::Remote => "remote",
            CloseReason::Failed(_) => "failed",
            CloseReason::Expired => "expired",
            CloseReason::Departed => "departed",
            CloseReason::Superseded => "superseded",
            CloseReason::Renegotiating => "renegotiating",
            CloseReason::Local => "local",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

/// Something a connection delivered before it reported itself connected.
#[derive(Debug)]
pub enum EarlyDelivery {
    Data(Bytes),
    Track(RemoteTrack),
}

pub struct PeerSession {
    pub session_id: SessionId,
    pub client_id: String,
    pub context_id: String,
    pub state: SessionState,
    pub is_initiator: bool,
    pub first_seen_at: Instant,
    pub last_seen_at: Instant,
    /// Highest record sequence the remote has published.
    pub sequence: u64,
    pub connection: Option<Arc<dyn PeerConnection>>,
    /// Bumped every time a new connection object replaces the old one.
    pub generation: u64,
    /// Highest network epoch the remote has published.
    pub remote_epoch: u64,
    /// Position in connect order, while connected.
    pub connect_order: Option<u64>,
    pub early: Vec<EarlyDelivery>,
}

impl PeerSession {
    pub fn new(
        session_id: SessionId,
        client_id: String,
        context_id: String,
        is_initiator: bool,
        remote_epoch: u64,
        now: Instant,
    ) -> Self {
        Self {
            session_id,
            client_id,
            context_id,
            state: SessionState::Discovered,
            is_initiator,
            first_seen_at: now,
            last_seen_at: now,
            sequence: 0,
            connection: None,
            generation: 0,
            remote_epoch,
            connect_order: None,
            early: Vec::new(),
        }
    }

    /// `last_seen_at` never moves backwards.
    pub fn touch(&mut self, now: Instant) {
        if now > self.last_seen_at {
            self.last_seen_at = now;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn expires_at(&self, expiration: Duration) -> Instant {
        self.last_seen_at + expiration
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            client_id: self.client_id.clone(),
            context_id: self.context_id.clone(),
            state: self.state,
            is_initiator: self.is_initiator,
            generation: self.generation,
            last_seen_at: self.last_seen_at,
        }
    }
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("session_id", &self.session_id)
            .field("client_id", &self.client_id)
            .field("state", &self.state)
            .field("is_initiator", &self.is_initiator)
            .field("generation", &self.generation)
            .field("has_connection", &self.connection.is_some())
            .field("early", &self.early.len())
            .finish()
    }
}

/// Read-only copy of a session for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub client_id: String,
    pub context_id: String,
    pub state: SessionState,
    pub is_initiator: bool,
    pub generation: u64,
    pub last_seen_at: Instant,
}

/// Remote sessions keyed by session id. The engine task is the only writer;
/// handles and the engine's query methods read through shared clones.
#[derive(Clone, Default)]
pub struct PeerSessionTable {
    inner: Arc<RwLock<HashMap<SessionId, PeerSession>>>,
}

impl PeerSessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.inner.read().contains_key(session_id)
    }

    /// Inserts `session` unless one already exists. Returns whether it was
    /// inserted.
    pub fn insert_if_absent(&self, session: PeerSession) -> bool {
        let mut guard = self.inner.write();
        if guard.contains_key(&session.session_id) {
            return false;
        }
        guard.insert(session.session_id.clone(), session);
        true
    }

    pub fn get<R>(&self, session_id: &SessionId, read: impl FnOnce(&PeerSession) -> R) -> Option<R> {
        self.inner.read().get(session_id).map(read)
    }

    pub fn update<R>(
        &self,
        session_id: &SessionId,
        update: impl FnOnce(&mut PeerSession) -> R,
    ) -> Option<R> {
        let mut guard = self.inner.write();
        let session = guard.get_mut(session_id)?;
        let result = update(session);
        debug_assert_eq!(
            session.connection.is_some(),
            session.state.holds_connection(),
            "session {} left in {:?}",
            session.session_id,
            session.state
        );
        Some(result)
    }

    pub fn remove(&self, session_id: &SessionId) -> Option<PeerSession> {
        self.inner.write().remove(session_id)
    }

    /// Sessions whose last sighting is at least `expiration` old.
    pub fn expired(&self, now: Instant, expiration: Duration) -> Vec<SessionId> {
        let mut expired: Vec<SessionId> = self
            .inner
            .read()
            .values()
            .filter(|session| session.expires_at(expiration) <= now)
            .map(|session| session.session_id.clone())
            .collect();
        expired.sort();
        expired
    }

    pub fn next_expiry(&self, expiration: Duration) -> Option<Instant> {
        self.inner
            .read()
            .values()
            .map(|session| session.expires_at(expiration))
            .min()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.inner.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Sessions that fell silent once a sibling with the same client and
    /// context ids showed up, as `(due, silent, sibling)`. A session is due
    /// `grace` after its last sighting; publishing again clears it.
    fn supersession_candidates(&self, grace: Duration) -> Vec<(Instant, SessionId, SessionId)> {
        let guard = self.inner.read();
        let mut candidates: Vec<_> = guard
            .values()
            .filter_map(|silent| {
                let sibling = guard
                    .values()
                    .filter(|other| {
                        other.session_id != silent.session_id
                            && other.client_id == silent.client_id
                            && other.context_id == silent.context_id
                            && other.first_seen_at >= silent.last_seen_at
                    })
                    .map(|other| &other.session_id)
                    .min()?;
                Some((
                    silent.last_seen_at + grace,
                    silent.session_id.clone(),
                    sibling.clone(),
                ))
            })
            .collect();
        candidates.sort();
        candidates
    }

    /// Sessions replaced by a sibling from the same context, paired with it.
    pub fn superseded(&self, now: Instant, grace: Duration) -> Vec<(SessionId, SessionId)> {
        self.supersession_candidates(grace)
            .into_iter()
            .filter(|(due, _, _)| *due <= now)
            .map(|(_, silent, sibling)| (silent, sibling))
            .collect()
    }

    pub fn next_supersession(&self, grace: Duration) -> Option<Instant> {
        self.supersession_candidates(grace)
            .first()
            .map(|(due, _, _)| *due)
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<SessionSnapshot> =
            self.inner.read().values().map(PeerSession::snapshot).collect();
        snapshots.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        snapshots
    }

    /// Connected sessions in the order they connected, with their connection.
    pub fn connected(&self) -> Vec<(SessionSnapshot, Arc<dyn PeerConnection>)> {
        let guard = self.inner.read();
        let mut connected: Vec<_> = guard
            .values()
            .filter(|session| session.is_connected())
            .filter_map(|session| {
                let connection = session.connection.clone()?;
                let order = session.connect_order.unwrap_or(u64::MAX);
                Some((order, session.snapshot(), connection))
            })
            .collect();
        connected.sort_by_key(|(order, _, _)| *order);
        connected
            .into_iter()
            .map(|(_, snapshot, connection)| (snapshot, connection))
            .collect()
    }
}

impl fmt::Debug for PeerSessionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSessionTable")
            .field("sessions", &self.len())
            .finish()
    }
}
