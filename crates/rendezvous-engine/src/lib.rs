//! Serverless peer discovery over a pollable relay.
//!
//! Every participant periodically uploads a presence record to a shared room
//! and downloads everyone else's. Signaling payloads for peer connections
//! ride inside those records, so two participants can build a direct link
//! with nothing between them but a dumb append-and-read store.

pub mod config;
pub mod connection;
pub mod context;
pub mod engine;
pub mod error;
pub mod model;
pub mod network;
mod peer;
pub mod relay;
mod router;
pub mod scheduler;
pub mod table;
pub mod transport;

pub use config::{ConnectionOptions, EngineOptions, IceServerConfig};
pub use engine::{BroadcastReport, Engine, EngineBuilder, EngineEvent};
pub use error::{EngineError, NegotiationError, TransportError};
pub use model::{PresenceRecord, SessionId, SignalingEnvelope};
pub use peer::PeerHandle;
