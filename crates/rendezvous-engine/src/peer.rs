use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::connection::{MediaTrack, PeerConnection};
use crate::error::EngineError;
use crate::model::SessionId;
use crate::table::PeerSessionTable;

/// Requests a [`PeerHandle`] posts back to the engine task.
#[derive(Debug)]
pub(crate) enum PeerRequest {
    /// Local traffic happened; keeps the poll cadence fast.
    Activity,
    Close { session_id: SessionId, generation: u64 },
}

/// A connected remote session, as handed out in engine events.
///
/// Stays valid as a value after the peer goes away; operations then fail
/// with [`EngineError::NotConnected`].
#[derive(Clone)]
pub struct PeerHandle {
    session_id: SessionId,
    client_id: String,
    context_id: String,
    generation: u64,
    connection: Arc<dyn PeerConnection>,
    table: PeerSessionTable,
    control: mpsc::UnboundedSender<PeerRequest>,
}

impl PeerHandle {
    pub(crate) fn new(
        session_id: SessionId,
        client_id: String,
        context_id: String,
        generation: u64,
        connection: Arc<dyn PeerConnection>,
        table: PeerSessionTable,
        control: mpsc::UnboundedSender<PeerRequest>,
    ) -> Self {
        Self {
            session_id,
            client_id,
            context_id,
            generation,
            connection,
            table,
            control,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_connected(&self) -> bool {
        self.table
            .get(&self.session_id, |session| {
                session.is_connected() && session.generation == self.generation
            })
            .unwrap_or(false)
    }

    fn ensure_connected(&self) -> Result<(), EngineError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(EngineError::NotConnected(self.session_id.clone()))
        }
    }

    pub fn send(&self, data: impl Into<Bytes>) -> Result<(), EngineError> {
        self.ensure_connected()?;
        self.connection.send(data.into())?;
        let _ = self.control.send(PeerRequest::Activity);
        Ok(())
    }

    pub fn add_track(&self, track: MediaTrack) -> Result<(), EngineError> {
        self.ensure_connected()?;
        self.connection.add_track(track)?;
        let _ = self.control.send(PeerRequest::Activity);
        Ok(())
    }

    pub fn remove_track(&self, track_id: &str) -> Result<(), EngineError> {
        self.ensure_connected()?;
        self.connection.remove_track(track_id)?;
        let _ = self.control.send(PeerRequest::Activity);
        Ok(())
    }

    /// Ask the engine to close this peer. A `PeerClose` event follows.
    pub fn close(&self) {
        let _ = self.control.send(PeerRequest::Close {
            session_id: self.session_id.clone(),
            generation: self.generation,
        });
    }
}

impl PartialEq for PeerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.session_id == other.session_id && self.generation == other.generation
    }
}

impl Eq for PeerHandle {}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerHandle")
            .field("session_id", &self.session_id)
            .field("client_id", &self.client_id)
            .field("generation", &self.generation)
            .finish()
    }
}
