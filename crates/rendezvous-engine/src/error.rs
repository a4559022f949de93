use std::time::Duration;

use thiserror::Error;

use crate::model::SessionId;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("engine already started")]
    AlreadyStarted,
    #[error("engine has been destroyed")]
    Destroyed,
    #[error("peer {0} is not connected")]
    NotConnected(SessionId),
    #[error("engine event stream already taken")]
    EventsTaken,
    #[error("engine requires a tokio runtime: {0}")]
    Runtime(String),
    #[error("relay transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),
}

/// A failed relay round trip. Always recoverable: the outgoing queue is kept
/// and the next scheduled poll retries.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("relay round trip timed out after {0:?}")]
    Timeout(Duration),
    #[error("relay returned status {0}")]
    Status(u16),
    #[error("relay http error: {0}")]
    Http(String),
    #[error("invalid relay payload: {0}")]
    Decode(String),
    #[error("relay unavailable: {0}")]
    Unavailable(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            TransportError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            TransportError::Status(status.as_u16())
        } else {
            TransportError::Http(err.to_string())
        }
    }
}

/// Failures reported by or while driving a connection object.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("connection setup failed: {0}")]
    Setup(String),
    #[error("unrecognised signal payload: {0}")]
    InvalidSignal(String),
    #[error("data channel is not open")]
    NotOpen,
    #[error("connection closed")]
    Closed,
    #[error("{0} not supported by this connection")]
    Unsupported(&'static str),
    #[error("negotiation failed: {0}")]
    Failed(String),
}

pub(crate) fn to_setup_error<E: std::fmt::Display>(err: E) -> NegotiationError {
    NegotiationError::Setup(err.to_string())
}
