use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_remote::TrackRemote;

use super::{
    ConnectRequest, ConnectionEvents, MediaTrack, PeerConnection, PeerConnector, RemoteMedia,
    SignalPayload,
};
use crate::config::ConnectionOptions;
use crate::error::{NegotiationError, to_setup_error};
use crate::model::SessionId;

/// Builds webrtc-rs peer connections with a single data channel, trickle ICE
/// and optional media tracks.
#[derive(Clone, Debug, Default)]
pub struct WebRtcConnector;

impl WebRtcConnector {
    pub fn new() -> Self {
        Self
    }
}

fn build_api(setting: SettingEngine) -> Result<API, NegotiationError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn spawn_task<F>(future: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(_) => tracing::warn!(
            target = "rendezvous::webrtc",
            "no tokio runtime available; dropping connection task"
        ),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RtcSignal {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    Candidate {
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    },
    /// Sent by the answering side when it needs the offering side to start a
    /// new offer/answer round.
    Renegotiate,
}

enum Command {
    Signal(RtcSignal),
    AddTrack(MediaTrack),
    RemoveTrack(String),
    NegotiationNeeded,
    Close,
}

#[derive(Debug, Default)]
struct LinkState {
    open: AtomicBool,
    closed: AtomicBool,
}

impl LinkState {
    /// Returns true for the first caller only.
    fn mark_closed(&self) -> bool {
        self.open.store(false, Ordering::SeqCst);
        !self.closed.swap(true, Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        let ConnectRequest {
            initiator,
            local_session,
            remote_session,
            ice_servers,
            options,
            events,
        } = request;

        let mut setting = SettingEngine::default();
        setting.set_ice_timeouts(
            Some(options.ice_disconnected_timeout),
            Some(options.ice_failed_timeout),
            Some(options.ice_keepalive_interval),
        );
        let api = build_api(setting)?;
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(to_setup_error)?,
        );
        tracing::debug!(
            target = "rendezvous::webrtc",
            local = %local_session,
            peer = %remote_session,
            initiator,
            "peer connection created"
        );

        let state = Arc::new(LinkState::default());
        let (command_tx, command_rx) = mpsc::unbounded_channel::<Command>();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Bytes>();
        let (channel_tx, channel_rx) = oneshot::channel::<Arc<RTCDataChannel>>();
        let channel_slot = Arc::new(Mutex::new(Some(channel_tx)));

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => emit(
                        &events,
                        &RtcSignal::Candidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        },
                    ),
                    Err(err) => tracing::warn!(
                        target = "rendezvous::webrtc",
                        peer = %events.session_id(),
                        error = %err,
                        "failed to serialize local ice candidate"
                    ),
                }
            })
        }));

        let state_events = events.clone();
        let state_for_pc = Arc::clone(&state);
        pc.on_peer_connection_state_change(Box::new(move |pc_state| {
            let events = state_events.clone();
            let state = Arc::clone(&state_for_pc);
            Box::pin(async move {
                tracing::debug!(
                    target = "rendezvous::webrtc",
                    peer = %events.session_id(),
                    state = ?pc_state,
                    "peer connection state changed"
                );
                match pc_state {
                    RTCPeerConnectionState::Failed => {
                        if state.mark_closed() {
                            events.error(NegotiationError::Failed("ice connection failed".into()));
                        }
                    }
                    RTCPeerConnectionState::Closed => {
                        if state.mark_closed() {
                            events.closed();
                        }
                    }
                    _ => {}
                }
            })
        }));

        let track_events = events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                tracing::debug!(
                    target = "rendezvous::webrtc",
                    peer = %track_events.session_id(),
                    track_id = %track.id(),
                    kind = ?track.kind(),
                    "remote track added"
                );
                track_events.track(Arc::new(WebRtcRemoteTrack(track)));
                Box::pin(async {})
            },
        ));

        let negotiation_commands = command_tx.clone();
        pc.on_negotiation_needed(Box::new(move || {
            let commands = negotiation_commands.clone();
            Box::pin(async move {
                let _ = commands.send(Command::NegotiationNeeded);
            })
        }));

        if initiator {
            let init = RTCDataChannelInit {
                ordered: Some(options.ordered),
                ..Default::default()
            };
            let dc = pc
                .create_data_channel(&options.data_channel_label, Some(init))
                .await
                .map_err(to_setup_error)?;
            wire_data_channel(dc, &events, &state, &channel_slot);
        } else {
            let dc_events = events.clone();
            let dc_state = Arc::clone(&state);
            let dc_slot = Arc::clone(&channel_slot);
            pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                wire_data_channel(dc, &dc_events, &dc_state, &dc_slot);
                Box::pin(async {})
            }));
        }

        spawn_task(run_sender(channel_rx, outbound_rx, events.session_id().clone()));

        let negotiator = Negotiator {
            pc,
            initiator,
            events,
            options,
            state: Arc::clone(&state),
            negotiated: false,
            renegotiate_pending: false,
            pending_candidates: Vec::new(),
            senders: HashMap::new(),
        };
        spawn_task(negotiator.run(command_rx));

        Ok(Arc::new(WebRtcConnection {
            remote: remote_session,
            commands: command_tx,
            outbound: outbound_tx,
            state,
        }))
    }
}

fn emit(events: &ConnectionEvents, signal: &RtcSignal) {
    match serde_json::to_value(signal) {
        Ok(payload) => events.signal(payload),
        Err(err) => tracing::warn!(
            target = "rendezvous::webrtc",
            peer = %events.session_id(),
            error = %err,
            "failed to encode signal"
        ),
    }
}

fn wire_data_channel(
    dc: Arc<RTCDataChannel>,
    events: &ConnectionEvents,
    state: &Arc<LinkState>,
    slot: &Arc<Mutex<Option<oneshot::Sender<Arc<RTCDataChannel>>>>>,
) {
    let Some(ready) = slot.lock().take() else {
        tracing::debug!(
            target = "rendezvous::webrtc",
            peer = %events.session_id(),
            label = dc.label(),
            "ignoring extra data channel"
        );
        return;
    };

    let open_events = events.clone();
    let open_state = Arc::clone(state);
    let open_dc = Arc::clone(&dc);
    let ready = Arc::new(Mutex::new(Some(ready)));
    dc.on_open(Box::new(move || {
        let events = open_events.clone();
        let state = Arc::clone(&open_state);
        let dc = Arc::clone(&open_dc);
        let ready = Arc::clone(&ready);
        Box::pin(async move {
            if let Some(ready) = ready.lock().take() {
                let _ = ready.send(dc);
            }
            if state.is_closed() || state.open.swap(true, Ordering::SeqCst) {
                return;
            }
            tracing::debug!(target = "rendezvous::webrtc", peer = %events.session_id(), "data channel open");
            events.connected();
        })
    }));

    let message_events = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = message_events.clone();
        Box::pin(async move {
            events.data(msg.data);
        })
    }));

    let error_events = events.clone();
    dc.on_error(Box::new(move |err| {
        let events = error_events.clone();
        Box::pin(async move {
            tracing::warn!(target = "rendezvous::webrtc", peer = %events.session_id(), error = %err, "data channel error");
        })
    }));

    let close_events = events.clone();
    let close_state = Arc::clone(state);
    dc.on_close(Box::new(move || {
        let events = close_events.clone();
        let state = Arc::clone(&close_state);
        Box::pin(async move {
            if state.mark_closed() {
                tracing::debug!(target = "rendezvous::webrtc", peer = %events.session_id(), "data channel closed");
                events.closed();
            }
        })
    }));
}

async fn run_sender(
    channel: oneshot::Receiver<Arc<RTCDataChannel>>,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    peer: SessionId,
) {
    let Ok(dc) = channel.await else {
        return;
    };
    while let Some(data) = outbound.recv().await {
        if let Err(err) = dc.send(&data).await {
            tracing::warn!(
                target = "rendezvous::webrtc",
                %peer,
                error = %err,
                "data channel send failed"
            );
            break;
        }
    }
}

struct Negotiator {
    pc: Arc<RTCPeerConnection>,
    initiator: bool,
    events: ConnectionEvents,
    options: ConnectionOptions,
    state: Arc<LinkState>,
    /// First offer/answer round completed.
    negotiated: bool,
    renegotiate_pending: bool,
    pending_candidates: Vec<RTCIceCandidateInit>,
    senders: HashMap<String, Arc<RTCRtpSender>>,
}

impl Negotiator {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        if self.initiator {
            if let Err(err) = self.make_offer().await {
                self.fail(err);
            }
        }
        while let Some(command) = commands.recv().await {
            let result = match command {
                Command::Signal(signal) => self.handle_signal(signal).await,
                Command::AddTrack(track) => self.add_track(track).await,
                Command::RemoveTrack(track_id) => self.remove_track(&track_id).await,
                Command::NegotiationNeeded => self.negotiation_needed().await,
                Command::Close => break,
            };
            if let Err(err) = result {
                self.fail(err);
            }
        }
        if let Err(err) = self.pc.close().await {
            tracing::debug!(
                target = "rendezvous::webrtc",
                peer = %self.events.session_id(),
                error = %err,
                "peer connection close failed"
            );
        }
    }

    fn fail(&self, err: NegotiationError) {
        tracing::warn!(
            target = "rendezvous::webrtc",
            peer = %self.events.session_id(),
            error = %err,
            "negotiation failed"
        );
        if self.state.mark_closed() {
            self.events.error(err);
        }
    }

    fn outgoing_sdp(&self, sdp: &str) -> String {
        match &self.options.sdp_transform {
            Some(transform) => transform.apply(sdp),
            None => sdp.to_string(),
        }
    }

    async fn local_sdp(&self) -> Result<String, NegotiationError> {
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| NegotiationError::Setup("missing local description".into()))?;
        Ok(self.outgoing_sdp(&local.sdp))
    }

    async fn make_offer(&mut self) -> Result<(), NegotiationError> {
        let offer = self.pc.create_offer(None).await.map_err(to_setup_error)?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(to_setup_error)?;
        let sdp = self.local_sdp().await?;
        tracing::trace!(target = "rendezvous::webrtc", peer = %self.events.session_id(), "sending offer");
        emit(&self.events, &RtcSignal::Offer { sdp });
        Ok(())
    }

    async fn handle_signal(&mut self, signal: RtcSignal) -> Result<(), NegotiationError> {
        match signal {
            RtcSignal::Offer { sdp } => {
                if self.initiator {
                    return Err(NegotiationError::InvalidSignal(
                        "offering side received an offer".into(),
                    ));
                }
                let offer = RTCSessionDescription::offer(sdp).map_err(to_setup_error)?;
                self.pc
                    .set_remote_description(offer)
                    .await
                    .map_err(to_setup_error)?;
                self.flush_candidates().await;
                let answer = self.pc.create_answer(None).await.map_err(to_setup_error)?;
                self.pc
                    .set_local_description(answer)
                    .await
                    .map_err(to_setup_error)?;
                let sdp = self.local_sdp().await?;
                emit(&self.events, &RtcSignal::Answer { sdp });
                self.negotiated = true;
                Ok(())
            }
            RtcSignal::Answer { sdp } => {
                if !self.initiator {
                    return Err(NegotiationError::InvalidSignal(
                        "answering side received an answer".into(),
                    ));
                }
                if self.pc.signaling_state() != RTCSignalingState::HaveLocalOffer {
                    tracing::debug!(
                        target = "rendezvous::webrtc",
                        peer = %self.events.session_id(),
                        "ignoring answer without an outstanding offer"
                    );
                    return Ok(());
                }
                let answer = RTCSessionDescription::answer(sdp).map_err(to_setup_error)?;
                self.pc
                    .set_remote_description(answer)
                    .await
                    .map_err(to_setup_error)?;
                self.flush_candidates().await;
                self.negotiated = true;
                if std::mem::take(&mut self.renegotiate_pending) {
                    self.make_offer().await?;
                }
                Ok(())
            }
            RtcSignal::Candidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => {
                let init = RTCIceCandidateInit {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                    username_fragment: None,
                };
                if self.pc.remote_description().await.is_none() {
                    self.pending_candidates.push(init);
                } else {
                    self.add_candidate(init).await;
                }
                Ok(())
            }
            RtcSignal::Renegotiate => {
                if self.initiator {
                    self.offer_when_stable().await
                } else {
                    Err(NegotiationError::InvalidSignal(
                        "answering side asked to renegotiate".into(),
                    ))
                }
            }
        }
    }

    async fn add_candidate(&self, init: RTCIceCandidateInit) {
        if let Err(err) = self.pc.add_ice_candidate(init).await {
            tracing::warn!(
                target = "rendezvous::webrtc",
                peer = %self.events.session_id(),
                error = %err,
                "failed to add remote ice candidate"
            );
        }
    }

    async fn flush_candidates(&mut self) {
        for init in std::mem::take(&mut self.pending_candidates) {
            self.add_candidate(init).await;
        }
    }

    async fn offer_when_stable(&mut self) -> Result<(), NegotiationError> {
        if self.negotiated && self.pc.signaling_state() == RTCSignalingState::Stable {
            self.make_offer().await
        } else {
            self.renegotiate_pending = true;
            Ok(())
        }
    }

    async fn negotiation_needed(&mut self) -> Result<(), NegotiationError> {
        if !self.negotiated {
            return Ok(());
        }
        if self.initiator {
            self.offer_when_stable().await
        } else {
            emit(&self.events, &RtcSignal::Renegotiate);
            Ok(())
        }
    }

    async fn add_track(&mut self, track: MediaTrack) -> Result<(), NegotiationError> {
        let track_id = track.id().to_string();
        let sender = self.pc.add_track(track).await.map_err(to_setup_error)?;
        self.senders.insert(track_id, sender);
        Ok(())
    }

    async fn remove_track(&mut self, track_id: &str) -> Result<(), NegotiationError> {
        let Some(sender) = self.senders.remove(track_id) else {
            tracing::debug!(
                target = "rendezvous::webrtc",
                peer = %self.events.session_id(),
                track_id,
                "remove_track for unknown track"
            );
            return Ok(());
        };
        self.pc.remove_track(&sender).await.map_err(to_setup_error)
    }
}

struct WebRtcRemoteTrack(Arc<TrackRemote>);

impl RemoteMedia for WebRtcRemoteTrack {
    fn id(&self) -> String {
        self.0.id()
    }

    fn stream_id(&self) -> String {
        self.0.stream_id()
    }

    fn webrtc_track(&self) -> Option<Arc<TrackRemote>> {
        Some(Arc::clone(&self.0))
    }
}

struct WebRtcConnection {
    remote: SessionId,
    commands: mpsc::UnboundedSender<Command>,
    outbound: mpsc::UnboundedSender<Bytes>,
    state: Arc<LinkState>,
}

impl WebRtcConnection {
    fn command(&self, command: Command) -> Result<(), NegotiationError> {
        if self.state.is_closed() {
            return Err(NegotiationError::Closed);
        }
        self.commands
            .send(command)
            .map_err(|_| NegotiationError::Closed)
    }
}

impl PeerConnection for WebRtcConnection {
    fn signal(&self, payload: SignalPayload) -> Result<(), NegotiationError> {
        let signal: RtcSignal = serde_json::from_value(payload)
            .map_err(|err| NegotiationError::InvalidSignal(err.to_string()))?;
        self.command(Command::Signal(signal))
    }

    fn send(&self, data: Bytes) -> Result<(), NegotiationError> {
        if self.state.is_closed() {
            return Err(NegotiationError::Closed);
        }
        if !self.state.open.load(Ordering::SeqCst) {
            return Err(NegotiationError::NotOpen);
        }
        self.outbound.send(data).map_err(|_| NegotiationError::Closed)
    }

    fn add_track(&self, track: MediaTrack) -> Result<(), NegotiationError> {
        self.command(Command::AddTrack(track))
    }

    fn remove_track(&self, track_id: &str) -> Result<(), NegotiationError> {
        self.command(Command::RemoveTrack(track_id.to_string()))
    }

    fn close(&self) {
        self.state.mark_closed();
        if self.commands.send(Command::Close).is_err() {
            tracing::trace!(
                target = "rendezvous::webrtc",
                peer = %self.remote,
                "negotiator already stopped"
            );
        }
    }
}
