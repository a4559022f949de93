use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::config::{ConnectionCustomizer, ConnectionOptions};
use crate::connection::{
    ConnectRequest, ConnectionEvent, ConnectionEventKind, ConnectionEvents, PeerConnection,
    PeerConnector,
};
use crate::error::NegotiationError;
use crate::engine::EngineEvent;
use crate::model::{LocalPresence, PresenceRecord, SessionId, is_initiator};
use crate::peer::{PeerHandle, PeerRequest};
use crate::table::{CloseReason, EarlyDelivery, PeerSession, PeerSessionTable, SessionState};
use crate::transport::RendezvousTransport;

/// What brings a retired session back. Ordered from most to least lenient.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Revival {
    /// Any record newer than the last one seen.
    NewerRecord,
    /// A record on a higher network epoch.
    NewEpoch,
    Never,
}

/// A remote session we stopped talking to. Its records are ignored until
/// `revival` says otherwise.
#[derive(Clone, Copy, Debug)]
struct Retired {
    remote_epoch: u64,
    sequence: u64,
    revival: Revival,
    last_seen: Instant,
}

impl Retired {
    fn revived_by(&self, record: &PresenceRecord) -> bool {
        if record.departing {
            return false;
        }
        match self.revival {
            Revival::NewerRecord => {
                record.sequence > self.sequence || record.network_epoch > self.remote_epoch
            }
            Revival::NewEpoch => record.network_epoch > self.remote_epoch,
            Revival::Never => false,
        }
    }
}

impl EarlyDelivery {
    fn into_event(self, peer: PeerHandle) -> EngineEvent {
        match self {
            EarlyDelivery::Data(data) => EngineEvent::Message(peer, data),
            EarlyDelivery::Track(track) => EngineEvent::Track(peer, track),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct EnvelopeMark {
    highest: u64,
    last_seen: Instant,
}

pub(crate) struct RouterSettings {
    pub local: LocalPresence,
    pub ice_servers: Vec<RTCIceServer>,
    pub options: ConnectionOptions,
    pub customizer: Option<ConnectionCustomizer>,
    pub expiration: Duration,
    /// How long a session may stay silent after a sibling from the same
    /// context appeared before it counts as replaced.
    pub supersede_after: Duration,
}

/// Turns downloaded presence records into peer sessions and moves signaling
/// payloads between the relay and connection objects.
pub(crate) struct SignalingRouter {
    local: LocalPresence,
    table: PeerSessionTable,
    connector: Arc<dyn PeerConnector>,
    ice_servers: Vec<RTCIceServer>,
    options: ConnectionOptions,
    customizer: Option<ConnectionCustomizer>,
    expiration: Duration,
    supersede_after: Duration,
    connection_events: mpsc::UnboundedSender<ConnectionEvent>,
    engine_events: mpsc::UnboundedSender<EngineEvent>,
    control: mpsc::UnboundedSender<PeerRequest>,
    envelope_marks: HashMap<SessionId, EnvelopeMark>,
    retired: HashMap<SessionId, Retired>,
    next_generation: u64,
    connect_seq: u64,
}

impl SignalingRouter {
    pub fn new(
        settings: RouterSettings,
        table: PeerSessionTable,
        connector: Arc<dyn PeerConnector>,
        connection_events: mpsc::UnboundedSender<ConnectionEvent>,
        engine_events: mpsc::UnboundedSender<EngineEvent>,
        control: mpsc::UnboundedSender<PeerRequest>,
    ) -> Self {
        Self {
            local: settings.local,
            table,
            connector,
            ice_servers: settings.ice_servers,
            options: settings.options,
            customizer: settings.customizer,
            expiration: settings.expiration,
            supersede_after: settings.supersede_after,
            connection_events,
            engine_events,
            control,
            envelope_marks: HashMap::new(),
            retired: HashMap::new(),
            next_generation: 0,
            connect_seq: 0,
        }
    }

    pub fn local(&self) -> &LocalPresence {
        &self.local
    }

    /// Apply one record from another session. Returns true when it counted
    /// as activity.
    pub async fn handle_record(
        &mut self,
        record: PresenceRecord,
        now: Instant,
        transport: &mut RendezvousTransport,
    ) -> bool {
        let remote = record.session_id.clone();
        if remote == self.local.session_id {
            return false;
        }

        if let Some(retired) = self.retired.get_mut(&remote) {
            retired.last_seen = now;
            if !retired.revived_by(&record) {
                return false;
            }
            self.retired.remove(&remote);
            tracing::debug!(
                target = "rendezvous::router",
                peer = %remote,
                epoch = record.network_epoch,
                sequence = record.sequence,
                "retired peer is publishing again"
            );
        }

        if record.departing {
            let closed = self.close_session(&remote, CloseReason::Departed, transport);
            self.retire(&remote, record.network_epoch, record.sequence, Revival::Never, now);
            return closed;
        }

        let mut activity = false;
        if !self.table.contains(&remote) {
            activity = true;
            if !self.discover(&record, now, transport).await {
                return activity;
            }
        }

        let known_epoch = self
            .table
            .update(&remote, |session| {
                session.touch(now);
                session.sequence = session.sequence.max(record.sequence);
                session.remote_epoch
            })
            .unwrap_or(record.network_epoch);
        if record.network_epoch > known_epoch {
            tracing::debug!(
                target = "rendezvous::router",
                peer = %remote,
                from = known_epoch,
                to = record.network_epoch,
                "peer moved to a new network epoch; renegotiating"
            );
            self.renegotiate(&remote, record.network_epoch, now, transport)
                .await;
            activity = true;
        }

        activity | self.deliver_envelopes(&record, now, transport)
    }

    fn deliver_envelopes(
        &mut self,
        record: &PresenceRecord,
        now: Instant,
        transport: &mut RendezvousTransport,
    ) -> bool {
        let remote = &record.session_id;
        let mut delivered = false;
        let local = self.local.session_id.clone();
        for envelope in record.envelopes_for(&local) {
            let mark = self
                .envelope_marks
                .entry(remote.clone())
                .or_insert(EnvelopeMark {
                    highest: 0,
                    last_seen: now,
                });
            mark.last_seen = now;
            if envelope.id <= mark.highest {
                continue;
            }
            mark.highest = envelope.id;

            if envelope.to_epoch != self.local.network_epoch {
                tracing::trace!(
                    target = "rendezvous::router",
                    peer = %remote,
                    envelope = envelope.id,
                    to_epoch = envelope.to_epoch,
                    "dropping envelope addressed to an earlier local epoch"
                );
                continue;
            }
            let Some((remote_epoch, connection)) = self
                .table
                .get(remote, |session| (session.remote_epoch, session.connection.clone()))
            else {
                continue;
            };
            if envelope.from_epoch < remote_epoch {
                tracing::trace!(
                    target = "rendezvous::router",
                    peer = %remote,
                    envelope = envelope.id,
                    "dropping envelope from an earlier remote epoch"
                );
                continue;
            }
            let Some(connection) = connection else {
                continue;
            };
            delivered = true;
            if let Err(err) = connection.signal(envelope.payload.clone()) {
                self.signal_rejected(remote, envelope.id, err, now, transport);
                break;
            }
        }
        delivered
    }

    /// A connection that cannot take a signal will never finish negotiating.
    fn signal_rejected(
        &mut self,
        remote: &SessionId,
        envelope: u64,
        err: NegotiationError,
        now: Instant,
        transport: &mut RendezvousTransport,
    ) {
        tracing::debug!(
            target = "rendezvous::router",
            peer = %remote,
            envelope,
            error = %err,
            "connection rejected signal"
        );
        self.close_and_retire(remote, CloseReason::Failed(err.to_string()), now, transport);
    }

    /// Close sessions that went silent after a sibling from the same client
    /// and context appeared, such as a page that reloaded.
    fn sweep_superseded(&mut self, now: Instant, transport: &mut RendezvousTransport) -> bool {
        let mut closed = false;
        for (silent, sibling) in self.table.superseded(now, self.supersede_after) {
            if !self.table.contains(&sibling) {
                continue;
            }
            let Some((epoch, sequence)) = self
                .table
                .get(&silent, |session| (session.remote_epoch, session.sequence))
            else {
                continue;
            };
            tracing::debug!(
                target = "rendezvous::router",
                peer = %silent,
                replacement = %sibling,
                "session superseded by a newer one from the same context"
            );
            if self.close_session(&silent, CloseReason::Superseded, transport) {
                self.retire(&silent, epoch, sequence, Revival::NewerRecord, now);
                closed = true;
            }
        }
        closed
    }

    async fn discover(
        &mut self,
        record: &PresenceRecord,
        now: Instant,
        transport: &mut RendezvousTransport,
    ) -> bool {
        let initiator = is_initiator(
            &self.local.client_id,
            &self.local.session_id,
            &record.client_id,
            &record.session_id,
        );
        let session = PeerSession::new(
            record.session_id.clone(),
            record.client_id.clone(),
            record.context_id.clone(),
            initiator,
            record.network_epoch,
            now,
        );
        if !self.table.insert_if_absent(session) {
            return true;
        }
        tracing::info!(
            target = "rendezvous::router",
            peer = %record.session_id,
            client_id = %record.client_id,
            initiator,
            "discovered peer"
        );
        self.start_connection(&record.session_id, now, transport).await
    }

    /// Builds a fresh connection object for `remote` under a new generation.
    async fn start_connection(
        &mut self,
        remote: &SessionId,
        now: Instant,
        transport: &mut RendezvousTransport,
    ) -> bool {
        self.next_generation += 1;
        let generation = self.next_generation;
        let Some((initiator, remote_epoch, sequence)) = self.table.update(remote, |session| {
            session.state = SessionState::Discovered;
            session.generation = generation;
            session.connection = None;
            session.connect_order = None;
            session.early.clear();
            (session.is_initiator, session.remote_epoch, session.sequence)
        }) else {
            return false;
        };

        let mut options = self.options.clone();
        if let Some(customizer) = &self.customizer {
            customizer.apply(&mut options);
        }
        let request = ConnectRequest {
            initiator,
            local_session: self.local.session_id.clone(),
            remote_session: remote.clone(),
            ice_servers: self.ice_servers.clone(),
            options,
            events: ConnectionEvents::new(remote.clone(), generation, self.connection_events.clone()),
        };
        match self.connector.connect(request).await {
            Ok(connection) => {
                let stored = self.table.update(remote, |session| {
                    session.connection = Some(Arc::clone(&connection));
                    session.state = SessionState::Negotiating;
                });
                if stored.is_none() {
                    connection.close();
                    return false;
                }
                tracing::debug!(
                    target = "rendezvous::router",
                    peer = %remote,
                    generation,
                    initiator,
                    "negotiating"
                );
                true
            }
            Err(err) => {
                tracing::warn!(
                    target = "rendezvous::router",
                    peer = %remote,
                    error = %err,
                    "failed to create connection"
                );
                self.table.remove(remote);
                transport.drop_envelopes_to(remote);
                self.retire(remote, remote_epoch, sequence, Revival::NewEpoch, now);
                false
            }
        }
    }

    /// Replace the connection to `remote`, announcing a close first if the
    /// old one was connected.
    async fn renegotiate(
        &mut self,
        remote: &SessionId,
        remote_epoch: u64,
        now: Instant,
        transport: &mut RendezvousTransport,
    ) {
        let Some((connection, was_connected)) = self.table.update(remote, |session| {
            session.remote_epoch = session.remote_epoch.max(remote_epoch);
            let was_connected = session.is_connected();
            if session.connection.is_some() {
                session.state = SessionState::Closing;
            }
            (session.connection.clone(), was_connected)
        }) else {
            return;
        };
        transport.drop_envelopes_to(remote);
        if let Some(connection) = connection {
            if was_connected {
                if let Some(handle) = self.handle_for_connection(remote, &connection) {
                    self.emit(EngineEvent::PeerClose(handle));
                }
            }
            connection.close();
        }
        tracing::debug!(
            target = "rendezvous::router",
            peer = %remote,
            reason = CloseReason::Renegotiating.as_str(),
            "connection replaced"
        );
        self.start_connection(remote, now, transport).await;
    }

    pub async fn handle_connection_event(
        &mut self,
        event: ConnectionEvent,
        now: Instant,
        transport: &mut RendezvousTransport,
    ) -> bool {
        let ConnectionEvent {
            session_id,
            generation,
            kind,
        } = event;
        let Some((current, remote_epoch)) = self
            .table
            .get(&session_id, |session| (session.generation, session.remote_epoch))
        else {
            return false;
        };
        if current != generation {
            tracing::trace!(
                target = "rendezvous::router",
                peer = %session_id,
                generation,
                current,
                "ignoring event from a replaced connection"
            );
            return false;
        }

        match kind {
            ConnectionEventKind::Signal(payload) => {
                let id = transport.enqueue(
                    session_id.clone(),
                    self.local.network_epoch,
                    remote_epoch,
                    payload,
                );
                tracing::trace!(
                    target = "rendezvous::router",
                    peer = %session_id,
                    envelope = id,
                    "queued local signal"
                );
                true
            }
            ConnectionEventKind::Connected => self.mark_connected(&session_id),
            ConnectionEventKind::Data(data) => {
                self.deliver(&session_id, EarlyDelivery::Data(data))
            }
            ConnectionEventKind::Track(track) => {
                self.deliver(&session_id, EarlyDelivery::Track(track))
            }
            ConnectionEventKind::Closed => {
                self.close_and_retire(&session_id, CloseReason::Remote, now, transport)
            }
            ConnectionEventKind::Error(err) => self.close_and_retire(
                &session_id,
                CloseReason::Failed(err.to_string()),
                now,
                transport,
            ),
        }
    }

    /// Hand data or media to the application, holding it back until the
    /// session has announced itself as connected.
    fn deliver(&mut self, session_id: &SessionId, delivery: EarlyDelivery) -> bool {
        let Some((state, connection)) = self
            .table
            .get(session_id, |session| (session.state, session.connection.clone()))
        else {
            return false;
        };
        match (state, connection) {
            (SessionState::Connected, Some(connection)) => {
                if let Some(handle) = self.handle_for_connection(session_id, &connection) {
                    self.emit(delivery.into_event(handle));
                }
            }
            (SessionState::Negotiating, Some(_)) => {
                self.table
                    .update(session_id, |session| session.early.push(delivery));
            }
            _ => return false,
        }
        true
    }

    fn mark_connected(&mut self, session_id: &SessionId) -> bool {
        self.connect_seq += 1;
        let seq = self.connect_seq;
        let Some((connection, buffered)) = self.table.update(session_id, |session| {
            if session.state != SessionState::Negotiating {
                return None;
            }
            session.state = SessionState::Connected;
            session.connect_order = Some(seq);
            let connection = session.connection.clone()?;
            Some((connection, std::mem::take(&mut session.early)))
        })
        .flatten() else {
            return false;
        };
        let Some(handle) = self.handle_for_connection(session_id, &connection) else {
            return false;
        };
        tracing::info!(
            target = "rendezvous::router",
            peer = %session_id,
            client_id = handle.client_id(),
            generation = handle.generation(),
            "peer connected"
        );
        self.emit(EngineEvent::PeerConnect(handle.clone()));
        for delivery in buffered {
            self.emit(delivery.into_event(handle.clone()));
        }
        true
    }

    pub fn handle_peer_request(
        &mut self,
        request: PeerRequest,
        now: Instant,
        transport: &mut RendezvousTransport,
    ) -> bool {
        match request {
            PeerRequest::Activity => true,
            PeerRequest::Close {
                session_id,
                generation,
            } => {
                let current = self.table.get(&session_id, |session| session.generation);
                if current != Some(generation) {
                    return false;
                }
                self.close_and_retire(&session_id, CloseReason::Local, now, transport)
            }
        }
    }

    fn close_and_retire(
        &mut self,
        session_id: &SessionId,
        reason: CloseReason,
        now: Instant,
        transport: &mut RendezvousTransport,
    ) -> bool {
        let Some((epoch, sequence)) = self
            .table
            .get(session_id, |session| (session.remote_epoch, session.sequence))
        else {
            return false;
        };
        let closed = self.close_session(session_id, reason, transport);
        if closed {
            self.retire(session_id, epoch, sequence, Revival::NewEpoch, now);
        }
        closed
    }

    /// Close and forget a session. Emits `PeerClose` only if it had connected.
    pub fn close_session(
        &mut self,
        session_id: &SessionId,
        reason: CloseReason,
        transport: &mut RendezvousTransport,
    ) -> bool {
        let handle = self.handle_for(session_id);
        let Some(was_connected) = self.table.update(session_id, |session| {
            let was_connected = session.is_connected();
            if session.connection.is_some() {
                session.state = SessionState::Closing;
            }
            was_connected
        }) else {
            return false;
        };
        let Some(mut session) = self.table.remove(session_id) else {
            return false;
        };
        if let Some(connection) = session.connection.take() {
            connection.close();
        }
        session.state = if reason == CloseReason::Expired {
            SessionState::Expired
        } else {
            SessionState::Closed
        };
        transport.drop_envelopes_to(session_id);

        let level_reason = reason.as_str();
        match &reason {
            CloseReason::Failed(detail) => tracing::warn!(
                target = "rendezvous::router",
                peer = %session_id,
                reason = level_reason,
                detail = %detail,
                was_connected,
                state = ?session.state,
                "peer session closed"
            ),
            _ => tracing::info!(
                target = "rendezvous::router",
                peer = %session_id,
                reason = level_reason,
                was_connected,
                state = ?session.state,
                "peer session closed"
            ),
        }
        if was_connected {
            if let Some(handle) = handle {
                self.emit(EngineEvent::PeerClose(handle));
            }
        }
        true
    }

    /// Our network changed: move to a new epoch and rebuild every link.
    pub async fn on_network_change(&mut self, now: Instant, transport: &mut RendezvousTransport) {
        self.local.network_epoch += 1;
        self.retired
            .retain(|_, retired| retired.revival == Revival::Never);
        tracing::info!(
            target = "rendezvous::router",
            epoch = self.local.network_epoch,
            peers = self.table.len(),
            "network changed; renegotiating all peers"
        );
        for remote in self.table.session_ids() {
            self.renegotiate(&remote, 0, now, transport).await;
        }
    }

    /// Expire sessions not seen within the expiration interval and close
    /// the ones a sibling from the same context replaced.
    pub fn sweep(&mut self, now: Instant, transport: &mut RendezvousTransport) -> bool {
        let expired = self.table.expired(now, self.expiration);
        let mut activity = !expired.is_empty();
        for session_id in expired {
            self.close_session(&session_id, CloseReason::Expired, transport);
        }
        activity |= self.sweep_superseded(now, transport);
        let horizon = self.expiration;
        self.retired
            .retain(|_, retired| now.saturating_duration_since(retired.last_seen) < horizon);
        self.envelope_marks.retain(|session, mark| {
            self.table.contains(session) || now.saturating_duration_since(mark.last_seen) < horizon
        });
        activity
    }

    /// When [`SignalingRouter::sweep`] next has work to do.
    pub fn next_sweep(&self) -> Option<Instant> {
        let expiry = self.table.next_expiry(self.expiration);
        let supersession = self.table.next_supersession(self.supersede_after);
        match (expiry, supersession) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Close everything; connected peers get a `PeerClose`.
    pub fn shutdown(&mut self, transport: &mut RendezvousTransport) {
        for session_id in self.table.session_ids() {
            self.close_session(&session_id, CloseReason::Shutdown, transport);
        }
        self.local.departing = true;
    }

    fn retire(
        &mut self,
        session_id: &SessionId,
        remote_epoch: u64,
        sequence: u64,
        revival: Revival,
        now: Instant,
    ) {
        let entry = self.retired.entry(session_id.clone()).or_insert(Retired {
            remote_epoch,
            sequence,
            revival,
            last_seen: now,
        });
        entry.remote_epoch = entry.remote_epoch.max(remote_epoch);
        entry.sequence = entry.sequence.max(sequence);
        entry.revival = entry.revival.max(revival);
        entry.last_seen = now;
    }

    fn handle_for(&self, session_id: &SessionId) -> Option<PeerHandle> {
        let connection = self
            .table
            .get(session_id, |session| session.connection.clone())
            .flatten()?;
        self.handle_for_connection(session_id, &connection)
    }

    fn handle_for_connection(
        &self,
        session_id: &SessionId,
        connection: &Arc<dyn PeerConnection>,
    ) -> Option<PeerHandle> {
        self.table.get(session_id, |session| {
            PeerHandle::new(
                session.session_id.clone(),
                session.client_id.clone(),
                session.context_id.clone(),
                session.generation,
                Arc::clone(connection),
                self.table.clone(),
                self.control.clone(),
            )
        })
    }

    fn emit(&self, event: EngineEvent) {
        if self.engine_events.send(event).is_err() {
            tracing::trace!(target = "rendezvous::router", "event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{RemoteMedia, SignalPayload};
    use crate::error::NegotiationError;
    use crate::model::SignalingEnvelope;
    use crate::relay::MemoryRelay;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct Recorded {
        connects: Mutex<Vec<(SessionId, bool)>>,
        labels: Mutex<Vec<String>>,
        signals: Mutex<Vec<SignalPayload>>,
        closes: Mutex<usize>,
        reject_signals: Mutex<bool>,
    }

    struct RecordingConnector(Arc<Recorded>);

    struct RecordingConnection(Arc<Recorded>);

    #[async_trait]
    impl PeerConnector for RecordingConnector {
        async fn connect(
            &self,
            request: ConnectRequest,
        ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
            self.0
                .connects
                .lock()
                .push((request.remote_session.clone(), request.initiator));
            self.0
                .labels
                .lock()
                .push(request.options.data_channel_label.clone());
            if request.initiator {
                request.events.signal(json!({"type": "offer"}));
            }
            Ok(Arc::new(RecordingConnection(Arc::clone(&self.0))))
        }
    }

    impl PeerConnection for RecordingConnection {
        fn signal(&self, payload: SignalPayload) -> Result<(), NegotiationError> {
            if *self.0.reject_signals.lock() {
                return Err(NegotiationError::InvalidSignal("unexpected payload".into()));
            }
            self.0.signals.lock().push(payload);
            Ok(())
        }

        fn send(&self, _data: Bytes) -> Result<(), NegotiationError> {
            Ok(())
        }

        fn close(&self) {
            *self.0.closes.lock() += 1;
        }
    }

    struct Harness {
        router: SignalingRouter,
        transport: RendezvousTransport,
        table: PeerSessionTable,
        recorded: Arc<Recorded>,
        connection_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
        engine_rx: mpsc::UnboundedReceiver<EngineEvent>,
        _control_rx: mpsc::UnboundedReceiver<PeerRequest>,
    }

    struct FakeTrack(&'static str);

    impl RemoteMedia for FakeTrack {
        fn id(&self) -> String {
            self.0.to_string()
        }

        fn stream_id(&self) -> String {
            "stream".to_string()
        }
    }

    const SUPERSEDE_AFTER: Duration = Duration::from_secs(18);

    fn harness(client: &str, session: &str) -> Harness {
        harness_with(client, session, None)
    }

    fn harness_with(client: &str, session: &str, customizer: Option<ConnectionCustomizer>) -> Harness {
        let table = PeerSessionTable::new();
        let recorded = Arc::new(Recorded::default());
        let (connection_tx, connection_rx) = mpsc::unbounded_channel();
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let local = LocalPresence::new(SessionId::from(session), client.into(), format!("{client}-ctx"));
        let router = SignalingRouter::new(
            RouterSettings {
                local,
                ice_servers: Vec::new(),
                options: ConnectionOptions::default(),
                customizer,
                expiration: Duration::from_secs(120),
                supersede_after: SUPERSEDE_AFTER,
            },
            table.clone(),
            Arc::new(RecordingConnector(Arc::clone(&recorded))),
            connection_tx,
            engine_tx,
            control_tx,
        );
        let transport = RendezvousTransport::new(
            Arc::new(MemoryRelay::new()),
            "room1",
            SessionId::from(session),
            Duration::from_secs(1),
        );
        Harness {
            router,
            transport,
            table,
            recorded,
            connection_rx,
            engine_rx,
            _control_rx: control_rx,
        }
    }

    fn record(client: &str, session: &str, context: &str) -> PresenceRecord {
        record_seq(client, session, context, 1)
    }

    fn record_seq(client: &str, session: &str, context: &str, sequence: u64) -> PresenceRecord {
        let local = LocalPresence::new(SessionId::from(session), client.into(), context.into());
        PresenceRecord::new(&local, sequence, Vec::new())
    }

    fn event(session: &str, generation: u64, kind: ConnectionEventKind) -> ConnectionEvent {
        ConnectionEvent {
            session_id: SessionId::from(session),
            generation,
            kind,
        }
    }

    fn envelope(id: u64, from: &str, to: &str, to_epoch: u64) -> SignalingEnvelope {
        SignalingEnvelope {
            id,
            from: SessionId::from(from),
            to: SessionId::from(to),
            from_epoch: 0,
            to_epoch,
            payload: json!({"id": id}),
        }
    }

    #[tokio::test]
    async fn discovery_creates_one_negotiating_session() {
        let mut h = harness("bob", "bob-1");
        let now = Instant::now();
        let alice = record("alice", "alice-1", "alice-ctx");
        assert!(h.router.handle_record(alice.clone(), now, &mut h.transport).await);
        h.router.handle_record(alice, now, &mut h.transport).await;

        assert_eq!(h.table.len(), 1);
        assert_eq!(h.recorded.connects.lock().len(), 1);
        let snapshot = &h.table.snapshots()[0];
        assert_eq!(snapshot.state, SessionState::Negotiating);
        assert!(snapshot.is_initiator, "bob > alice so bob offers");

        let event = h.connection_rx.try_recv().expect("offer signal");
        assert!(matches!(event.kind, ConnectionEventKind::Signal(_)));
        assert!(h.router.handle_connection_event(event, now, &mut h.transport).await);
        assert_eq!(h.transport.pending_envelopes(), 1);
    }

    #[tokio::test]
    async fn duplicate_envelopes_are_fed_once() {
        let mut h = harness("alice", "alice-1");
        let now = Instant::now();
        let mut bob = record("bob", "bob-1", "bob-ctx");
        bob.envelopes.push(envelope(1, "bob-1", "alice-1", 0));
        bob.envelopes.push(envelope(2, "bob-1", "carol-1", 0));

        h.router.handle_record(bob.clone(), now, &mut h.transport).await;
        h.router.handle_record(bob.clone(), now, &mut h.transport).await;
        bob.envelopes.push(envelope(3, "bob-1", "alice-1", 0));
        h.router.handle_record(bob, now, &mut h.transport).await;

        let signals = h.recorded.signals.lock().clone();
        assert_eq!(signals, vec![json!({"id": 1}), json!({"id": 3})]);
        assert_eq!(h.recorded.connects.lock().len(), 1);
    }

    #[tokio::test]
    async fn envelopes_for_an_old_local_epoch_are_dropped() {
        let mut h = harness("alice", "alice-1");
        let now = Instant::now();
        let mut bob = record("bob", "bob-1", "bob-ctx");
        bob.envelopes.push(envelope(1, "bob-1", "alice-1", 0));
        h.router.on_network_change(now, &mut h.transport).await;
        h.router.handle_record(bob, now, &mut h.transport).await;
        assert!(h.recorded.signals.lock().is_empty());
    }

    #[tokio::test]
    async fn connected_event_flushes_buffered_data_after_connect() {
        let mut h = harness("alice", "alice-1");
        let now = Instant::now();
        h.router
            .handle_record(record("bob", "bob-1", "bob-ctx"), now, &mut h.transport)
            .await;
        let generation = h.table.snapshots()[0].generation;
        let event = |kind| ConnectionEvent {
            session_id: SessionId::from("bob-1"),
            generation,
            kind,
        };
        h.router
            .handle_connection_event(
                event(ConnectionEventKind::Data(Bytes::from_static(b"early"))),
                now,
                &mut h.transport,
            )
            .await;
        h.router
            .handle_connection_event(event(ConnectionEventKind::Connected), now, &mut h.transport)
            .await;

        assert!(matches!(h.engine_rx.try_recv(), Ok(EngineEvent::PeerConnect(_))));
        match h.engine_rx.try_recv() {
            Ok(EngineEvent::Message(peer, data)) => {
                assert_eq!(peer.session_id().as_str(), "bob-1");
                assert_eq!(&data[..], b"early");
            }
            other => panic!("expected buffered message, got {other:?}"),
        }

        h.router
            .handle_connection_event(event(ConnectionEventKind::Closed), now, &mut h.transport)
            .await;
        assert!(matches!(h.engine_rx.try_recv(), Ok(EngineEvent::PeerClose(_))));
        assert!(h.table.is_empty());
    }

    #[tokio::test]
    async fn stale_generation_events_are_ignored() {
        let mut h = harness("alice", "alice-1");
        let now = Instant::now();
        h.router
            .handle_record(record("bob", "bob-1", "bob-ctx"), now, &mut h.transport)
            .await;
        let stale = ConnectionEvent {
            session_id: SessionId::from("bob-1"),
            generation: 999,
            kind: ConnectionEventKind::Closed,
        };
        assert!(!h.router.handle_connection_event(stale, now, &mut h.transport).await);
        assert_eq!(h.table.len(), 1);
    }

    #[tokio::test]
    async fn departure_closes_and_retires_session() {
        let mut h = harness("alice", "alice-1");
        let now = Instant::now();
        let bob = record("bob", "bob-1", "bob-ctx");
        h.router.handle_record(bob.clone(), now, &mut h.transport).await;

        let mut leaving = bob.clone();
        leaving.departing = true;
        assert!(h.router.handle_record(leaving, now, &mut h.transport).await);
        assert!(h.table.is_empty());
        assert_eq!(*h.recorded.closes.lock(), 1);

        h.router.handle_record(bob, now, &mut h.transport).await;
        assert!(h.table.is_empty(), "departed sessions stay retired");
    }

    #[tokio::test]
    async fn closed_link_returns_on_new_remote_epoch() {
        let mut h = harness("alice", "alice-1");
        let now = Instant::now();
        let mut bob = record("bob", "bob-1", "bob-ctx");
        h.router.handle_record(bob.clone(), now, &mut h.transport).await;
        let generation = h.table.snapshots()[0].generation;
        let closed = ConnectionEvent {
            session_id: SessionId::from("bob-1"),
            generation,
            kind: ConnectionEventKind::Error(NegotiationError::Failed("ice".into())),
        };
        h.router.handle_connection_event(closed, now, &mut h.transport).await;
        assert!(h.table.is_empty());

        h.router.handle_record(bob.clone(), now, &mut h.transport).await;
        assert!(h.table.is_empty());

        bob.network_epoch = 1;
        h.router.handle_record(bob, now, &mut h.transport).await;
        assert_eq!(h.table.len(), 1);
    }

    #[tokio::test]
    async fn silent_session_is_superseded_by_its_successor() {
        let mut h = harness("alice", "alice-1");
        let now = Instant::now();
        h.router
            .handle_record(record("bob", "bob-1", "bob-ctx"), now, &mut h.transport)
            .await;
        let reload = now + Duration::from_secs(2);
        h.router
            .handle_record(record("bob", "bob-2", "bob-ctx"), reload, &mut h.transport)
            .await;
        assert_eq!(h.table.len(), 2, "both stay until the old one proves silent");
        assert_eq!(h.router.next_sweep(), Some(now + SUPERSEDE_AFTER));

        let due = now + SUPERSEDE_AFTER;
        assert!(h.router.sweep(due, &mut h.transport));
        assert_eq!(h.table.session_ids(), vec![SessionId::from("bob-2")]);

        h.router
            .handle_record(record("bob", "bob-1", "bob-ctx"), due, &mut h.transport)
            .await;
        assert_eq!(h.table.session_ids(), vec![SessionId::from("bob-2")], "stale copy ignored");
    }

    #[tokio::test]
    async fn live_sessions_sharing_a_context_coexist() {
        let mut h = harness("alice", "alice-1");
        let start = Instant::now();
        for tick in 0..12u64 {
            let now = start + Duration::from_secs(5 * tick);
            for session in ["bob-1", "bob-2"] {
                h.router
                    .handle_record(
                        record_seq("bob", session, "bob-ctx", tick + 1),
                        now,
                        &mut h.transport,
                    )
                    .await;
            }
            h.router.sweep(now, &mut h.transport);
        }
        assert_eq!(
            h.table.session_ids(),
            vec![SessionId::from("bob-1"), SessionId::from("bob-2")]
        );
    }

    #[tokio::test]
    async fn superseded_session_returns_when_it_publishes_again() {
        let mut h = harness("alice", "alice-1");
        let now = Instant::now();
        h.router
            .handle_record(record_seq("bob", "bob-1", "bob-ctx", 4), now, &mut h.transport)
            .await;
        h.router
            .handle_record(record("bob", "bob-2", "bob-ctx"), now, &mut h.transport)
            .await;
        let due = now + SUPERSEDE_AFTER;
        h.router
            .handle_record(record_seq("bob", "bob-2", "bob-ctx", 2), due, &mut h.transport)
            .await;
        assert!(h.router.sweep(due, &mut h.transport));
        assert!(!h.table.contains(&SessionId::from("bob-1")));

        h.router
            .handle_record(record_seq("bob", "bob-1", "bob-ctx", 5), due, &mut h.transport)
            .await;
        assert!(h.table.contains(&SessionId::from("bob-1")));
        assert_eq!(h.table.len(), 2);
    }

    #[tokio::test]
    async fn rejected_signal_fails_the_session() {
        let mut h = harness("alice", "alice-1");
        let now = Instant::now();
        let mut bob = record("bob", "bob-1", "bob-ctx");
        h.router.handle_record(bob.clone(), now, &mut h.transport).await;
        assert_eq!(h.table.len(), 1);

        *h.recorded.reject_signals.lock() = true;
        bob.sequence = 2;
        bob.envelopes.push(envelope(1, "bob-1", "alice-1", 0));
        h.router.handle_record(bob.clone(), now, &mut h.transport).await;
        assert!(h.table.is_empty());
        assert_eq!(*h.recorded.closes.lock(), 1);
        assert!(h.engine_rx.try_recv().is_err(), "never connected, so no close event");

        bob.sequence = 3;
        h.router.handle_record(bob, now, &mut h.transport).await;
        assert!(h.table.is_empty(), "failed sessions wait for a new network epoch");
    }

    #[tokio::test]
    async fn customizer_runs_for_every_connection() {
        let calls = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&calls);
        let customizer = ConnectionCustomizer::new(move |options| {
            *counter.lock() += 1;
            options.data_channel_label = format!("link-{}", *counter.lock());
        });
        let mut h = harness_with("alice", "alice-1", Some(customizer));
        let now = Instant::now();
        h.router
            .handle_record(record("bob", "bob-1", "bob-ctx"), now, &mut h.transport)
            .await;
        h.router
            .handle_record(record("carol", "carol-1", "carol-ctx"), now, &mut h.transport)
            .await;
        h.router.on_network_change(now, &mut h.transport).await;

        assert_eq!(*calls.lock(), 4);
        assert_eq!(
            h.recorded.labels.lock().clone(),
            vec!["link-1", "link-2", "link-3", "link-4"]
        );
        assert_eq!(h.router.options.data_channel_label, "data");
    }

    #[tokio::test]
    async fn remote_tracks_follow_peer_connect() {
        let mut h = harness("alice", "alice-1");
        let now = Instant::now();
        h.router
            .handle_record(record("bob", "bob-1", "bob-ctx"), now, &mut h.transport)
            .await;
        let generation = h.table.snapshots()[0].generation;
        let track = |id| ConnectionEventKind::Track(Arc::new(FakeTrack(id)));

        h.router
            .handle_connection_event(event("bob-1", generation, track("early")), now, &mut h.transport)
            .await;
        assert!(h.engine_rx.try_recv().is_err(), "held back until connected");
        h.router
            .handle_connection_event(
                event("bob-1", generation, ConnectionEventKind::Connected),
                now,
                &mut h.transport,
            )
            .await;
        h.router
            .handle_connection_event(event("bob-1", generation, track("late")), now, &mut h.transport)
            .await;

        assert!(matches!(h.engine_rx.try_recv(), Ok(EngineEvent::PeerConnect(_))));
        for expected in ["early", "late"] {
            match h.engine_rx.try_recv() {
                Ok(EngineEvent::Track(peer, track)) => {
                    assert_eq!(peer.session_id().as_str(), "bob-1");
                    assert_eq!(track.id(), expected);
                    assert!(track.webrtc_track().is_none());
                }
                other => panic!("expected track {expected}, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn expiry_removes_silent_sessions() {
        let mut h = harness("alice", "alice-1");
        let now = Instant::now();
        h.router
            .handle_record(record("bob", "bob-1", "bob-ctx"), now, &mut h.transport)
            .await;
        assert!(!h.router.sweep(now + Duration::from_secs(119), &mut h.transport));
        assert!(h.router.sweep(now + Duration::from_secs(120), &mut h.transport));
        assert!(h.table.is_empty());
        assert!(h.engine_rx.try_recv().is_err(), "never connected, so no close event");
    }

    #[tokio::test]
    async fn network_change_bumps_epoch_and_replaces_connections() {
        let mut h = harness("bob", "bob-1");
        let now = Instant::now();
        h.router
            .handle_record(record("alice", "alice-1", "alice-ctx"), now, &mut h.transport)
            .await;
        let before = h.table.snapshots()[0].generation;
        h.router.on_network_change(now, &mut h.transport).await;
        assert_eq!(h.router.local().network_epoch, 1);
        let after = &h.table.snapshots()[0];
        assert!(after.generation > before);
        assert_eq!(after.state, SessionState::Negotiating);
        assert_eq!(*h.recorded.closes.lock(), 1);
        assert_eq!(h.recorded.connects.lock().len(), 2);
    }
}
