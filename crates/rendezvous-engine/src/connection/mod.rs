//! Connection objects: the pieces that turn opaque signaling payloads into a
//! live peer link. The engine never looks inside a payload; it only routes
//! them between a [`PeerConnection`] and the relay.

mod memory;
mod rtc;

pub use self::memory::{MemoryConnector, MemoryNetwork};
pub use self::rtc::WebRtcConnector;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::ConnectionOptions;
use crate::error::NegotiationError;
use crate::model::SessionId;

pub type SignalPayload = Value;

pub type MediaTrack = Arc<dyn TrackLocal + Send + Sync>;

/// Media the remote side added to the link.
pub trait RemoteMedia: Send + Sync {
    fn id(&self) -> String;

    fn stream_id(&self) -> String;

    /// The webrtc track to read RTP from, for WebRTC links.
    fn webrtc_track(&self) -> Option<Arc<TrackRemote>> {
        None
    }
}

impl fmt::Debug for dyn RemoteMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteMedia")
            .field("id", &self.id())
            .field("stream_id", &self.stream_id())
            .finish()
    }
}

pub type RemoteTrack = Arc<dyn RemoteMedia>;

#[derive(Debug)]
pub struct ConnectionEvent {
    pub session_id: SessionId,
    /// Distinguishes successive connections to the same remote session.
    pub generation: u64,
    pub kind: ConnectionEventKind,
}

#[derive(Debug)]
pub enum ConnectionEventKind {
    /// A payload the remote side must receive.
    Signal(SignalPayload),
    Connected,
    Data(Bytes),
    Track(RemoteTrack),
    Closed,
    Error(NegotiationError),
}

/// Where a connection object reports back to the engine. Cheap to clone;
/// events sent after the engine stopped listening are discarded.
#[derive(Clone, Debug)]
pub struct ConnectionEvents {
    session_id: SessionId,
    generation: u64,
    tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ConnectionEvents {
    pub(crate) fn new(
        session_id: SessionId,
        generation: u64,
        tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        Self {
            session_id,
            generation,
            tx,
        }
    }

    /// The remote session this connection talks to.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_detached(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn signal(&self, payload: SignalPayload) {
        self.emit(ConnectionEventKind::Signal(payload));
    }

    pub fn connected(&self) {
        self.emit(ConnectionEventKind::Connected);
    }

    pub fn data(&self, data: Bytes) {
        self.emit(ConnectionEventKind::Data(data));
    }

    pub fn track(&self, track: RemoteTrack) {
        self.emit(ConnectionEventKind::Track(track));
    }

    pub fn closed(&self) {
        self.emit(ConnectionEventKind::Closed);
    }

    pub fn error(&self, err: NegotiationError) {
        self.emit(ConnectionEventKind::Error(err));
    }

    fn emit(&self, kind: ConnectionEventKind) {
        let event = ConnectionEvent {
            session_id: self.session_id.clone(),
            generation: self.generation,
            kind,
        };
        if self.tx.send(event).is_err() {
            tracing::trace!(
                target = "rendezvous::connection",
                peer = %self.session_id,
                generation = self.generation,
                "engine no longer listening; dropping connection event"
            );
        }
    }
}

/// Everything a connector needs to build one connection.
#[derive(Debug)]
pub struct ConnectRequest {
    pub initiator: bool,
    pub local_session: SessionId,
    pub remote_session: SessionId,
    pub ice_servers: Vec<RTCIceServer>,
    pub options: ConnectionOptions,
    pub events: ConnectionEvents,
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Build a connection object. An initiator starts negotiating right away
    /// and reports its first signal through `request.events`.
    async fn connect(&self, request: ConnectRequest) -> Result<Arc<dyn PeerConnection>, NegotiationError>;
}

/// A single negotiated link. Methods never block; work is handed to the
/// connection's own tasks.
pub trait PeerConnection: Send + Sync {
    /// Feed a payload produced by the remote side's connection.
    fn signal(&self, payload: SignalPayload) -> Result<(), NegotiationError>;

    fn send(&self, data: Bytes) -> Result<(), NegotiationError>;

    fn add_track(&self, _track: MediaTrack) -> Result<(), NegotiationError> {
        Err(NegotiationError::Unsupported("media tracks"))
    }

    fn remove_track(&self, _track_id: &str) -> Result<(), NegotiationError> {
        Err(NegotiationError::Unsupported("media tracks"))
    }

    /// Tear the link down. The remote side observes a close; no local
    /// `Closed` event is required.
    fn close(&self);
}
