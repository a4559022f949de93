//! Client side of the room relay: a dumb store that appends each uploaded
//! presence record and hands back whatever other participants appended since
//! the caller's cursor.

mod http;
mod memory;

pub use http::HttpRelayClient;
pub use memory::MemoryRelay;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::model::{PresenceRecord, SessionId};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PollRequest {
    pub room_id: String,
    pub record: PresenceRecord,
    /// Last cursor returned by the relay; `None` asks for a presence snapshot.
    pub cursor: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PollResponse {
    #[serde(default)]
    pub records: Vec<PresenceRecord>,
    pub cursor: Option<u64>,
}

#[async_trait]
pub trait RelayClient: Send + Sync {
    /// Upload `request.record` and download records newer than `request.cursor`.
    /// Uploads must be safe to repeat.
    async fn poll(&self, request: PollRequest) -> Result<PollResponse, TransportError>;

    /// Best-effort removal of a departing session from the room.
    async fn leave(&self, _room_id: &str, _session_id: &SessionId) -> Result<(), TransportError> {
        Ok(())
    }
}
