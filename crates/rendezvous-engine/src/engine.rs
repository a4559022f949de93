use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::config::EngineOptions;
use crate::connection::{ConnectionEvent, PeerConnector, RemoteTrack, WebRtcConnector};
use crate::context::{ContextIdStore, resolve_context_id};
use crate::error::EngineError;
use crate::model::{LocalPresence, MIN_LABEL_LEN, SessionId};
use crate::network::{NetworkChangeMonitor, NetworkIdentity, NetworkProbe, StunProbe};
use crate::peer::{PeerHandle, PeerRequest};
use crate::relay::{HttpRelayClient, RelayClient};
use crate::router::{RouterSettings, SignalingRouter};
use crate::scheduler::{PollingRates, PollingScheduler};
use crate::table::{PeerSessionTable, SessionSnapshot};
use crate::transport::{PollOutcome, RendezvousTransport};

/// What the engine reports to its consumer. For any one peer handle the
/// order is always connect, then messages and tracks, then close.
#[derive(Clone, Debug)]
pub enum EngineEvent {
    PeerConnect(PeerHandle),
    PeerClose(PeerHandle),
    Message(PeerHandle, Bytes),
    /// The peer added media to the link.
    Track(PeerHandle, RemoteTrack),
}

/// Per-peer outcome of [`Engine::broadcast`].
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: Vec<SessionId>,
    pub failed: Vec<(SessionId, EngineError)>,
}

impl BroadcastReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Destroyed,
}

pub struct EngineBuilder {
    client_id: String,
    room_id: String,
    options: EngineOptions,
    relay: Option<Arc<dyn RelayClient>>,
    connector: Option<Arc<dyn PeerConnector>>,
    probe: Option<Arc<dyn NetworkProbe>>,
    context_store: Option<Arc<dyn ContextIdStore>>,
}

impl EngineBuilder {
    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Use this relay instead of an HTTP client for `worker_url`.
    pub fn relay(mut self, relay: Arc<dyn RelayClient>) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn PeerConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn network_probe(mut self, probe: Arc<dyn NetworkProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn context_store(mut self, store: Arc<dyn ContextIdStore>) -> Self {
        self.context_store = Some(store);
        self
    }

    pub fn build(self) -> Result<Engine, EngineError> {
        check_label("clientId", &self.client_id)?;
        check_label("roomId", &self.room_id)?;
        self.options.validate()?;

        let relay = match self.relay {
            Some(relay) => relay,
            None => {
                let url = self.options.worker_url.clone().ok_or_else(|| {
                    EngineError::InvalidArgument("workerUrl is required without a custom relay".into())
                })?;
                Arc::new(HttpRelayClient::new(url, self.options.relay_timeout)?)
            }
        };
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(WebRtcConnector::new()));
        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(StunProbe::from_ice_servers(&self.options.stun_ice_servers)));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Ok(Engine {
            client_id: self.client_id,
            room_id: self.room_id,
            session_id: SessionId::generate(),
            options: self.options,
            relay,
            connector,
            probe,
            context_store: self.context_store,
            table: PeerSessionTable::new(),
            lifecycle: Mutex::new(Lifecycle::Created),
            context_id: Mutex::new(None),
            cancel: CancellationToken::new(),
            finished: CancellationToken::new(),
            events_tx: Mutex::new(Some(events_tx)),
            events_rx: Mutex::new(Some(events_rx)),
            control_tx,
            control_rx: Mutex::new(Some(control_rx)),
        })
    }
}

fn check_label(name: &str, value: &str) -> Result<(), EngineError> {
    if value.chars().count() < MIN_LABEL_LEN {
        return Err(EngineError::InvalidArgument(format!(
            "{name} must be at least {MIN_LABEL_LEN} characters"
        )));
    }
    Ok(())
}

/// One participant in a room. Polls the relay, keeps a session per remote
/// participant and hands out connected peers through [`Engine::events`].
pub struct Engine {
    client_id: String,
    room_id: String,
    session_id: SessionId,
    options: EngineOptions,
    relay: Arc<dyn RelayClient>,
    connector: Arc<dyn PeerConnector>,
    probe: Arc<dyn NetworkProbe>,
    context_store: Option<Arc<dyn ContextIdStore>>,
    table: PeerSessionTable,
    lifecycle: Mutex<Lifecycle>,
    context_id: Mutex<Option<String>>,
    cancel: CancellationToken,
    finished: CancellationToken,
    events_tx: Mutex<Option<mpsc::UnboundedSender<EngineEvent>>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<EngineEvent>>>,
    control_tx: mpsc::UnboundedSender<PeerRequest>,
    control_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerRequest>>>,
}

impl Engine {
    pub fn builder(client_id: impl Into<String>, room_id: impl Into<String>) -> EngineBuilder {
        EngineBuilder {
            client_id: client_id.into(),
            room_id: room_id.into(),
            options: EngineOptions::default(),
            relay: None,
            connector: None,
            probe: None,
            context_store: None,
        }
    }

    pub fn new(
        client_id: impl Into<String>,
        room_id: impl Into<String>,
        options: EngineOptions,
    ) -> Result<Self, EngineError> {
        Self::builder(client_id, room_id).options(options).build()
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Known once the engine has started.
    pub fn context_id(&self) -> Option<String> {
        self.context_id.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        *self.lifecycle.lock() == Lifecycle::Running
    }

    /// The event stream. Can be taken once, before or after `start`.
    pub fn events(&self) -> Result<mpsc::UnboundedReceiver<EngineEvent>, EngineError> {
        self.events_rx.lock().take().ok_or(EngineError::EventsTaken)
    }

    /// Spawn the engine task on the current tokio runtime. The first poll
    /// goes out immediately.
    pub fn start(&self) -> Result<(), EngineError> {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Running => return Err(EngineError::AlreadyStarted),
            Lifecycle::Destroyed => return Err(EngineError::Destroyed),
            Lifecycle::Created => {}
        }
        let handle = Handle::try_current().map_err(|err| EngineError::Runtime(err.to_string()))?;
        let (Some(events_tx), Some(control_rx)) =
            (self.events_tx.lock().take(), self.control_rx.lock().take())
        else {
            return Err(EngineError::AlreadyStarted);
        };

        let context_id = resolve_context_id(self.context_store.as_deref());
        *self.context_id.lock() = Some(context_id.clone());
        let local = LocalPresence::new(self.session_id.clone(), self.client_id.clone(), context_id);

        let rates = PollingRates::from_options(&self.options);
        let heartbeat = self.options.heartbeat_interval();
        let (connection_tx, connection_rx) = mpsc::unbounded_channel();
        let router = SignalingRouter::new(
            RouterSettings {
                local,
                ice_servers: self.options.ice_servers(),
                options: self.options.connection_options.clone(),
                customizer: self.options.connection_customizer.clone(),
                expiration: self.options.state_expiration_interval,
                supersede_after: rates.longest_gap(heartbeat) * 2 + self.options.relay_timeout,
            },
            self.table.clone(),
            Arc::clone(&self.connector),
            connection_tx,
            events_tx,
            self.control_tx.clone(),
        );
        let transport = RendezvousTransport::new(
            Arc::clone(&self.relay),
            self.room_id.clone(),
            self.session_id.clone(),
            self.options.relay_timeout,
        );
        let now = Instant::now();
        let scheduler = PollingScheduler::new(rates, now);

        let (network_tx, network_rx) = mpsc::unbounded_channel();
        let _guard = handle.enter();
        NetworkChangeMonitor::new(Arc::clone(&self.probe), self.options.network_change_poll_interval)
            .spawn(self.cancel.child_token(), network_tx);

        let task = EngineTask {
            router,
            transport,
            scheduler,
            heartbeat,
            last_poll: None,
            poll_task: None,
            connection_rx,
            control_rx,
            network_rx,
            cancel: self.cancel.clone(),
            finished: self.finished.clone(),
        };
        handle.spawn(task.run());

        tracing::info!(
            target = "rendezvous::engine",
            session_id = %self.session_id,
            client_id = %self.client_id,
            room = %self.room_id,
            "engine started"
        );
        *lifecycle = Lifecycle::Running;
        Ok(())
    }

    /// Send to one connected peer.
    pub fn send(&self, peer: &PeerHandle, data: impl Into<Bytes>) -> Result<(), EngineError> {
        if *self.lifecycle.lock() == Lifecycle::Destroyed {
            return Err(EngineError::Destroyed);
        }
        peer.send(data)
    }

    /// Send to every connected peer. One peer failing does not stop the rest.
    pub fn broadcast(&self, data: impl Into<Bytes>) -> BroadcastReport {
        let data = data.into();
        let mut report = BroadcastReport::default();
        if !self.is_running() {
            return report;
        }
        for (snapshot, connection) in self.table.connected() {
            match connection.send(data.clone()) {
                Ok(()) => report.delivered.push(snapshot.session_id),
                Err(err) => {
                    tracing::debug!(
                        target = "rendezvous::engine",
                        peer = %snapshot.session_id,
                        error = %err,
                        "broadcast to peer failed"
                    );
                    report.failed.push((snapshot.session_id, err.into()));
                }
            }
        }
        if !report.delivered.is_empty() {
            let _ = self.control_tx.send(PeerRequest::Activity);
        }
        report
    }

    /// Stop polling, close every connection and drop in-flight results.
    /// Safe to call from inside an event handler; repeated calls are no-ops.
    pub fn destroy(&self) -> Result<(), EngineError> {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Created => Err(EngineError::InvalidArgument(
                "destroy called before start".into(),
            )),
            Lifecycle::Destroyed => Ok(()),
            Lifecycle::Running => {
                *lifecycle = Lifecycle::Destroyed;
                tracing::info!(target = "rendezvous::engine", session_id = %self.session_id, "engine destroyed");
                self.cancel.cancel();
                Ok(())
            }
        }
    }

    /// Resolves once the engine task has shut down and its departure record
    /// has been offered to the relay.
    pub async fn closed(&self) {
        self.finished.cancelled().await;
    }

    /// Connected peers by session id.
    pub fn peers(&self) -> HashMap<SessionId, PeerHandle> {
        self.table
            .connected()
            .into_iter()
            .map(|(snapshot, connection)| {
                let handle = PeerHandle::new(
                    snapshot.session_id.clone(),
                    snapshot.client_id,
                    snapshot.context_id,
                    snapshot.generation,
                    connection,
                    self.table.clone(),
                    self.control_tx.clone(),
                );
                (snapshot.session_id, handle)
            })
            .collect()
    }

    /// Connected session ids, oldest connection first.
    pub fn connected_sessions(&self) -> Vec<SessionId> {
        self.table
            .connected()
            .into_iter()
            .map(|(snapshot, _)| snapshot.session_id)
            .collect()
    }

    pub fn session_states(&self) -> Vec<SessionSnapshot> {
        self.table.snapshots()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct EngineTask {
    router: SignalingRouter,
    transport: RendezvousTransport,
    scheduler: PollingScheduler,
    heartbeat: Duration,
    last_poll: Option<Instant>,
    poll_task: Option<JoinHandle<PollOutcome>>,
    connection_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    control_rx: mpsc::UnboundedReceiver<PeerRequest>,
    network_rx: mpsc::UnboundedReceiver<NetworkIdentity>,
    cancel: CancellationToken,
    finished: CancellationToken,
}

impl EngineTask {
    async fn run(mut self) {
        loop {
            let now = Instant::now();
            let poll_at = if self.transport.is_in_flight() {
                None
            } else {
                self.scheduler.next_poll_at(self.last_poll, self.heartbeat, now)
            };
            let sweep_at = self.router.next_sweep();

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(request) = self.control_rx.recv() => {
                    let now = Instant::now();
                    if self.router.handle_peer_request(request, now, &mut self.transport) {
                        self.scheduler.record_activity(now);
                    }
                }
                Some(event) = self.connection_rx.recv() => {
                    let now = Instant::now();
                    if self.router.handle_connection_event(event, now, &mut self.transport).await {
                        self.scheduler.record_activity(now);
                    }
                }
                joined = join_poll(&mut self.poll_task) => {
                    self.poll_task = None;
                    self.finish_poll(joined).await;
                }
                Some(identity) = self.network_rx.recv() => {
                    tracing::debug!(target = "rendezvous::engine", identity = ?identity, "renegotiating after network change");
                    let now = Instant::now();
                    self.router.on_network_change(now, &mut self.transport).await;
                    self.scheduler.record_activity(now);
                }
                _ = sleep_until_deadline(poll_at) => self.start_poll(),
                _ = sleep_until_deadline(sweep_at) => {
                    let now = Instant::now();
                    if self.router.sweep(now, &mut self.transport) {
                        self.scheduler.record_activity(now);
                    }
                }
            }
        }
        self.shutdown().await;
    }

    fn start_poll(&mut self) {
        let now = Instant::now();
        let Some(ticket) = self.transport.begin(self.router.local()) else {
            return;
        };
        tracing::trace!(
            target = "rendezvous::engine",
            mode = ?self.scheduler.mode(now),
            sequence = ticket.record().sequence,
            envelopes = ticket.record().envelopes.len(),
            "polling relay"
        );
        self.last_poll = Some(now);
        self.poll_task = Some(tokio::spawn(self.transport.round_trip(ticket)));
    }

    async fn finish_poll(&mut self, joined: Result<PollOutcome, JoinError>) {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(target = "rendezvous::engine", error = %err, "poll task failed");
                self.transport.abandon();
                return;
            }
        };
        let records = match self.transport.finish(outcome) {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(
                    target = "rendezvous::engine",
                    room = %self.transport.room_id(),
                    error = %err,
                    "relay poll failed; retrying on next tick"
                );
                return;
            }
        };
        let now = Instant::now();
        let mut activity = false;
        for record in records {
            activity |= self
                .router
                .handle_record(record, now, &mut self.transport)
                .await;
        }
        if activity {
            self.scheduler.record_activity(now);
        }
    }

    async fn shutdown(&mut self) {
        self.scheduler.stop();
        if let Some(task) = self.poll_task.take() {
            task.abort();
            self.transport.abandon();
        }
        self.router.shutdown(&mut self.transport);
        self.transport.departure(self.router.local()).await;
        tracing::debug!(target = "rendezvous::engine", "engine task stopped");
        self.finished.cancel();
    }
}

async fn join_poll(task: &mut Option<JoinHandle<PollOutcome>>) -> Result<PollOutcome, JoinError> {
    match task {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MemoryNetwork;
    use crate::network::StaticProbe;
    use crate::relay::MemoryRelay;

    fn builder(client: &str) -> EngineBuilder {
        Engine::builder(client, "room1")
            .relay(Arc::new(MemoryRelay::new()))
            .connector(Arc::new(MemoryNetwork::new().connector()))
            .network_probe(Arc::new(StaticProbe::default()))
    }

    #[test]
    fn short_labels_are_rejected() {
        assert!(matches!(
            builder("bob").build(),
            Err(EngineError::InvalidArgument(_))
        ));
        assert!(matches!(
            Engine::builder("alice", "abc").relay(Arc::new(MemoryRelay::new())).build(),
            Err(EngineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn http_relay_requires_worker_url() {
        let result = Engine::builder("alice", "room1").build();
        assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
    }

    #[test]
    fn start_requires_a_runtime() {
        let engine = builder("alice").build().unwrap();
        assert!(matches!(engine.start(), Err(EngineError::Runtime(_))));
        assert!(matches!(engine.destroy(), Err(EngineError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn lifecycle_errors_are_deterministic() {
        let engine = builder("alice").build().unwrap();
        assert!(matches!(engine.destroy(), Err(EngineError::InvalidArgument(_))));
        engine.start().unwrap();
        assert!(matches!(engine.start(), Err(EngineError::AlreadyStarted)));
        engine.destroy().unwrap();
        engine.destroy().unwrap();
        assert!(matches!(engine.start(), Err(EngineError::Destroyed)));
        engine.closed().await;
    }

    #[tokio::test]
    async fn events_can_only_be_taken_once() {
        let engine = builder("alice").build().unwrap();
        assert!(engine.events().is_ok());
        assert!(matches!(engine.events(), Err(EngineError::EventsTaken)));
    }
}
