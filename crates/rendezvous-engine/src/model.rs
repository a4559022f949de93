use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Minimum length accepted for client and room labels.
pub const MIN_LABEL_LEN: usize = 4;

/// Identifier of one engine instance. Fresh for every process lifetime, so a
/// single client id may own several sessions at once.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Opaque negotiation data addressed from one session to another. Only the
/// connection objects on either end understand `payload`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignalingEnvelope {
    /// Strictly increasing per sending session; receivers dedupe on it.
    pub id: u64,
    pub from: SessionId,
    pub to: SessionId,
    /// Sender's network epoch when the envelope was produced.
    #[serde(default)]
    pub from_epoch: u64,
    /// Recipient's network epoch as last observed by the sender.
    #[serde(default)]
    pub to_epoch: u64,
    pub payload: Value,
}

/// What every participant publishes on each poll.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub session_id: SessionId,
    pub client_id: String,
    pub context_id: String,
    pub sequence: u64,
    #[serde(default)]
    pub published_at_ms: u64,
    #[serde(default)]
    pub network_epoch: u64,
    #[serde(default)]
    pub departing: bool,
    #[serde(default)]
    pub envelopes: Vec<SignalingEnvelope>,
}

impl PresenceRecord {
    pub fn new(local: &LocalPresence, sequence: u64, envelopes: Vec<SignalingEnvelope>) -> Self {
        Self {
            session_id: local.session_id.clone(),
            client_id: local.client_id.clone(),
            context_id: local.context_id.clone(),
            sequence,
            published_at_ms: unix_millis(),
            network_epoch: local.network_epoch,
            departing: local.departing,
            envelopes,
        }
    }

    pub fn envelopes_for<'a>(
        &'a self,
        recipient: &'a SessionId,
    ) -> impl Iterator<Item = &'a SignalingEnvelope> + 'a {
        self.envelopes
            .iter()
            .filter(move |envelope| &envelope.to == recipient)
    }
}

/// The identity fields the local engine stamps onto every record it publishes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalPresence {
    pub session_id: SessionId,
    pub client_id: String,
    pub context_id: String,
    pub network_epoch: u64,
    pub departing: bool,
}

impl LocalPresence {
    pub fn new(session_id: SessionId, client_id: String, context_id: String) -> Self {
        Self {
            session_id,
            client_id,
            context_id,
            network_epoch: 0,
            departing: false,
        }
    }
}

/// Decides which side of a pair creates the offer. The greater
/// `(client_id, session_id)` tuple initiates, so both sides reach the same
/// answer without exchanging anything.
pub fn is_initiator(
    local_client: &str,
    local_session: &SessionId,
    remote_client: &str,
    remote_session: &SessionId,
) -> bool {
    (local_client, local_session.as_str()) > (remote_client, remote_session.as_str())
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
